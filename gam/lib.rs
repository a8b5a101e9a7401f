#![deny(dead_code)]
#![deny(unused_imports)]
pub mod basis;
pub mod centering;
pub mod config;
pub mod construction;
pub mod data;
pub mod design;
pub mod estimate;
pub mod knots;
pub mod model;
pub mod solver;
pub mod store;
