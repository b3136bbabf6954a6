//! Wire plumbing for the package side of the upload gate: bounded HTTP transport, deterministic
//! `.tar.gz` archives, content digests, and clients for the cookbook registry, the file storage
//! backend and the package-management server.

pub mod archive;
pub mod chef;
pub mod cookbook;
pub mod digest;
pub mod http;
pub mod registry;
pub mod storage;

pub use archive::{build_tar_gz, unpack_tar_gz, ArchiveLimits, Budget, LimitExceeded};
pub use chef::{ChefServer, HttpChefServer};
pub use cookbook::{CookbookItem, CookbookVersion, Metadata};
pub use digest::{normalize_line_endings, sha256_hex, ContentDigest};
pub use http::{describe_error_body, percent_encode, HttpClient, HttpResponse, TransportOptions};
pub use registry::{Lookup, Registry, SupermarketClient, Universe, UniverseEntry};
pub use storage::{BookshelfCredentials, BookshelfStorage, FileStoreStorage, Storage};
