/// Portable read-only SQL.
///
/// ```text
/// statement + @parameters
///       ↓
/// validator.rs   exactly one SELECT, no DML/DDL anywhere
///       ↓
/// binder.rs      @name ↔ parameter symmetry, backend value conversion
///       ↓
/// backend        native statement (PartiQL, Cosmos SQL, memory evaluator)
/// ```
///
/// `parser.rs` and `types.rs` give backends that evaluate queries locally a
/// typed AST of the supported subset.
pub mod binder;
pub mod parser;
pub mod types;
pub mod validator;

pub use binder::{
    bind_parameters, check_parameters, placeholders, validate_field_names, BindStyle,
    BoundStatement,
};
pub use parser::parse_select;
pub use types::*;
pub use validator::validate_statement;
