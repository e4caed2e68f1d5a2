pub mod asset;
pub mod pipeline;
pub mod search;
pub mod subtitle;
