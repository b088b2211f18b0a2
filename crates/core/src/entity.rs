//! Catalog entities.
//!
//! Timestamps are assigned by the store (`created_at`/`updated_at` column
//! defaults plus the refresh trigger); the structs here are the read shape
//! and the serialized outbox payload.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::{AuthorId, BookId};

/// A registered author.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Author {
    pub id: AuthorId,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A catalogued book with its bound authors.
///
/// `author_ids` is an unordered set; on update the new set replaces the old
/// one (the store applies the difference).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Book {
    pub id: BookId,
    pub name: String,
    pub author_ids: BTreeSet<AuthorId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn author_payload_parses_back() {
        let author = Author {
            id: AuthorId::new(),
            name: "Ada".to_string(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };

        let payload = serde_json::to_vec(&author).unwrap();
        let parsed: Author = serde_json::from_slice(&payload).unwrap();
        assert_eq!(parsed, author);
    }
}
