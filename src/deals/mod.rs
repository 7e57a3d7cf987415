// This file is part of apw. Copyright © 2025 apw contributors.
// apw is licensed under the GNU AGPL v3.0 or any later version. See LICENSE file for full text.

//! Lightning deals: the deal table, the CSV feed importer, and the feed service tying them to the job queue.

mod feed;
mod import;
mod store;

pub use feed::{DEAL_IMPORT_QUEUE, DealFeedService};
pub use import::{
    ChunkedOutcome, DealImportState, DealImporter, ImportChunk, ImportContinuation, ImportLimits, ImportStep,
    import_chunked,
};
pub use store::{Deal, DealStatus, DealStore, FeedDeal, PrettyDeal};
