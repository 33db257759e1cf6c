pub mod conversations;
pub mod storage_service;
pub mod sweeper;
