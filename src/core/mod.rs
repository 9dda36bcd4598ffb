//! The request-independent core: URL normalization, resource matching,
//! referrer validation, the data model, and the error taxonomy. Everything
//! in this module is pure or operates only on data passed in explicitly —
//! no I/O, no Pingora types.

pub mod envelope;
pub mod error;
pub mod matcher;
pub mod referrer;
pub mod referrer_pattern;
pub mod resource;
pub mod url;
