//! One CRUD and query contract over DynamoDB, Cosmos DB and in-memory
//! tables.
//!
//! ```ignore
//! let registry = Arc::new(PluginRegistry::new());
//! let db = Database::new(registry);
//! let table = db.table("hash_range")?;
//! table.put_item(item! { "hk" => "1", "rk" => "a", "num" => 5 })?;
//! let page = table.query_sql(
//!     "SELECT * FROM hash_range WHERE hk = @hk",
//!     Some(&[("@hk".to_string(), Value::from("1"))].into()),
//!     Some(10),
//!     None,
//! )?;
//! ```
pub mod backend;
pub mod config;
pub mod cursor;
pub mod error;
pub mod plugin;
pub mod sql;
pub mod table;
pub mod value;

pub use backend::{Backend, BackendKind, Page};
pub use config::{DatabaseClient, Env, Settings, TableConfig};
pub use cursor::Cursor;
pub use error::{Error, ErrorKind, Problem, Result};
pub use plugin::{PluginRegistry, TablePlugin, TABLE_NAMESPACE};
pub use table::{Database, PutOptions, QueryPage, Table};
pub use value::{Conditions, Item, Key, Parameters, Value};
