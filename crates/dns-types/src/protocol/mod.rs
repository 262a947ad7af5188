pub mod deserialise;
pub mod edns;
pub mod rrinfo;
pub mod serialise;
pub mod types;
