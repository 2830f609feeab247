//! End-to-end tests against a real store file.
//!
//! Each test file covers a specific scenario, driving the public engine API
//! on a multi-threaded runtime and checking what survives a reopen.

#![cfg(test)]

mod helpers;

mod test_async_db;
mod test_closed_engine;
mod test_items_range;
mod test_random_model;
mod test_reclamation;
mod test_remove_sequences;
mod test_replace_race;
mod test_split_order;
mod test_unclean_shutdown;
