//! Shared protocol definitions for the drawroom relay wire format.

pub mod presence;
pub mod relay;
