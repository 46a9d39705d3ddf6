pub mod handoff;
pub mod template;
