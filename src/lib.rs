pub mod cli;
pub mod config;
pub mod error;
pub mod flare;
pub mod persistence;
pub mod scheduler;
pub mod simulation;
pub mod state_machine;
pub mod ui;
pub mod work_unit;

#[cfg(test)]
mod testing;
