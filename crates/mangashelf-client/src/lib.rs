pub mod mangadex;

pub use mangadex::MangaDexTransport;
