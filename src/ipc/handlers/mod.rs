pub mod backup;
pub mod core;
pub mod enrollments;
pub mod grades;
pub mod reports;
pub mod subjects;
pub mod users;
