pub mod backup;
pub mod db;
pub mod grading;
pub mod ipc;
