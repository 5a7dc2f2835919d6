/// HTTP backend speaking the JSON completion contract.
pub mod http;
