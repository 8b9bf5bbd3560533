//! The world model for the Wayfinder proxy.
//!
//! Rooms form a directed graph keyed by string vnums; exits carry the
//! destination vnum rather than a reference, mirroring the on-disk JSON
//! format and sidestepping ownership cycles. [`world::World`] owns the
//! graph, the label index, and the editing command vocabulary;
//! [`database`] loads and saves the schema-versioned files; [`pathfind`]
//! computes weighted routes and compresses them into speedwalks.

pub mod database;
pub mod pathfind;
pub mod room;
pub mod world;

pub use room::{Direction, Exit, ExitDestination, Room, Terrain};
pub use world::World;
