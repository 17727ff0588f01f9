pub mod rss;

pub use rss::RssFeedClient;
