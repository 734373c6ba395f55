pub mod init;
pub mod modify;
