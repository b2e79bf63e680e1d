pub mod matching;
pub mod service;

pub use matching::{is_valid_match, MatchType, MatchedPair};
pub use service::TransactionMatcher;
