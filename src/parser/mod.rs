pub mod derive;
pub mod detail;
pub mod listing;

pub use detail::DetailExtractor;
pub use listing::KeyDiscoverer;
