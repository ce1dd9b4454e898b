pub mod api;
pub mod config;
pub mod link_repo;
pub mod link_service;
pub(crate) mod orm;
