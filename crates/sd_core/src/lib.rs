pub mod cache;
pub mod clock;
pub mod db;
pub mod domain;
pub mod error;
pub mod overview;
pub mod repo;
pub mod status;
pub mod timestamps;
