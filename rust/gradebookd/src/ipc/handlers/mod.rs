pub mod backup;
pub mod classes;
pub mod core;
pub mod grades;
pub mod profiles;
pub mod reports;
pub mod students;
