pub mod protocol;
pub mod stdio;
pub mod tools;
