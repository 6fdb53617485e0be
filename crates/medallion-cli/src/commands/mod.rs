pub mod init;
pub mod inspect;
pub mod merge;
pub mod run;
