pub mod bencode;
pub mod file;
