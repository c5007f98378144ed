pub use super::agents::Entity as Agents;
pub use super::auth_tokens::Entity as AuthTokens;
pub use super::sessions::Entity as Sessions;
pub use super::transactions::Entity as Transactions;
