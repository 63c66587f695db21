pub mod error;
pub mod mapper;
pub mod result;
pub mod throttle;

pub use error::{FetchError, FetchErrorKind};
pub use mapper::{FirecrawlMapper, UrlMapper};
pub use result::{FetchOptions, MapResult};
pub use throttle::{FetchThrottle, ThrottleGuard};
