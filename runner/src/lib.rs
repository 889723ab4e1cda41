pub mod builder;
pub mod calendar;
pub mod commands;
pub mod config;
pub mod database;
pub mod engine;
pub mod graph;
pub mod job;
pub mod packager;
pub mod platforms;
pub mod script;
pub mod sync;
