pub mod db;

pub use db::{
    create_db, get_session, record_end_reading, record_start_reading, upsert_session, DbPool,
    SqliteSessionStore,
};
