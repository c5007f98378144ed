pub use sea_orm_migration::prelude::*;

mod m20240301_000001_create_agents;
mod m20240301_000002_create_transactions;
mod m20240301_000003_create_sessions;
mod m20240301_000004_create_auth_tokens;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m20240301_000001_create_agents::Migration),
            Box::new(m20240301_000002_create_transactions::Migration),
            Box::new(m20240301_000003_create_sessions::Migration),
            Box::new(m20240301_000004_create_auth_tokens::Migration),
        ]
    }
}
