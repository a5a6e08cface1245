pub mod utils;

mod scenarios;
