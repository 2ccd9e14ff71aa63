mod concurrent_update_test;
mod migration_test;
