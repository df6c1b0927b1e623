mod proxy;
mod rotator;
mod statistics;
mod user;

pub use proxy::ProxyRepository;
pub use rotator::RotatorRepository;
pub use statistics::StatisticsRepository;
pub use user::UserRepository;
