mod database;

pub use database::DocState;
