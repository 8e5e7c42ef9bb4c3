pub mod accumulator;
pub mod session_store;
pub mod storage_service;
