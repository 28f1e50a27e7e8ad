pub mod outcomes;
pub mod probe;
pub mod run;
