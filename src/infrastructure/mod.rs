pub mod db;
pub mod external;
pub mod queue;
pub mod storage;
