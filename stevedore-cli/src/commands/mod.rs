pub mod build;
pub mod check;
pub mod export;
pub mod images;
pub mod init;
pub mod inspect;
pub mod rmi;
pub mod serve;
