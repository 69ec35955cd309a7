pub mod invite_repo;
pub mod key_repo;
pub mod payment_repo;
pub mod server_repo;
pub mod subscription_repo;
pub mod user_repo;

pub use invite_repo::InviteRepository;
pub use key_repo::KeyRepository;
pub use payment_repo::PaymentRepository;
pub use server_repo::ServerRepository;
pub use subscription_repo::SubscriptionRepository;
pub use user_repo::UserRepository;
