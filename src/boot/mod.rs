pub mod registrar;
pub mod secureboot;
pub mod uki;
