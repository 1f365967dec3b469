pub mod optimize;
pub mod run;
pub mod status;
