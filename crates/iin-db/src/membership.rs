//! Local and foreign membership records.

use iin_types::{CounterAttestedMembership, Membership};
use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;

/// Errors from the membership tables.
#[derive(Debug, Error)]
pub enum MembershipDbError {
    /// A statement failed or a stored column could not be decoded.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("failed to serialize membership: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// A foreign domain's membership as last recorded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredForeignMembership {
    pub membership: Membership,
    /// The counter-attested bundle that justified the record.
    pub counter_attested: CounterAttestedMembership,
    /// Nonce of the run that produced the record.
    pub nonce: String,
    /// Starts at 1 and grows by one per recording.
    pub version: i64,
    /// SQLite `datetime('now')` of the last write.
    pub updated_at: String,
}

/// Outcome of [`record_foreign_membership`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedMembership {
    pub security_domain: String,
    pub version: i64,
    /// `true` when no record existed for the domain before.
    pub created: bool,
}

/// One recorded version of a foreign domain's membership.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryEntry {
    pub nonce: String,
    pub version: i64,
    pub membership: Membership,
    /// When the version was written.
    pub recorded_at: String,
}

fn json_column<T: serde::de::DeserializeOwned>(idx: usize, raw: &str) -> rusqlite::Result<T> {
    serde_json::from_str(raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

/// Replaces the local domain's membership record.
pub fn store_local_membership(
    conn: &Connection,
    membership: &Membership,
) -> Result<(), MembershipDbError> {
    let json = serde_json::to_string(membership)?;
    conn.execute(
        "INSERT INTO local_membership (id, security_domain, membership_json)
         VALUES (1, ?1, ?2)
         ON CONFLICT(id) DO UPDATE SET
             security_domain = excluded.security_domain,
             membership_json = excluded.membership_json,
             updated_at = datetime('now')",
        params![membership.security_domain, json],
    )?;
    Ok(())
}

/// The local domain's membership, or `None` before one is stored.
///
/// # Errors
///
/// Returns `MembershipDbError::Database` if the query fails or the stored
/// JSON no longer decodes.
pub fn get_local_membership(conn: &Connection) -> Result<Option<Membership>, MembershipDbError> {
    let membership = conn
        .query_row(
            "SELECT membership_json FROM local_membership WHERE id = 1",
            [],
            |row| {
                let raw: String = row.get(0)?;
                json_column(0, &raw)
            },
        )
        .optional()?;
    Ok(membership)
}

/// Upserts a foreign domain's membership and appends it to the history log.
///
/// Both writes happen inside one savepoint so the current record and the log
/// never disagree.
///
/// # Errors
///
/// Returns `MembershipDbError` if either record cannot be serialized or
/// written. Nothing is kept on failure.
pub fn record_foreign_membership(
    conn: &mut Connection,
    membership: &Membership,
    counter_attested: &CounterAttestedMembership,
    nonce: &str,
) -> Result<RecordedMembership, MembershipDbError> {
    let membership_json = serde_json::to_string(membership)?;
    let bundle_json = serde_json::to_string(counter_attested)?;

    let sp = conn.savepoint()?;

    let previous: Option<i64> = sp
        .query_row(
            "SELECT version FROM foreign_memberships WHERE security_domain = ?1",
            [&membership.security_domain],
            |row| row.get(0),
        )
        .optional()?;
    let version = previous.map_or(1, |v| v + 1);

    sp.execute(
        "INSERT INTO foreign_memberships (
            security_domain, membership_json, counter_attested_json, nonce, version
         ) VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(security_domain) DO UPDATE SET
            membership_json = excluded.membership_json,
            counter_attested_json = excluded.counter_attested_json,
            nonce = excluded.nonce,
            version = excluded.version,
            updated_at = datetime('now')",
        params![
            membership.security_domain,
            membership_json,
            bundle_json,
            nonce,
            version
        ],
    )?;

    sp.execute(
        "INSERT INTO membership_history (security_domain, nonce, version, membership_json)
         VALUES (?1, ?2, ?3, ?4)",
        params![membership.security_domain, nonce, version, membership_json],
    )?;

    sp.commit()?;

    Ok(RecordedMembership {
        security_domain: membership.security_domain.clone(),
        version,
        created: previous.is_none(),
    })
}

const FOREIGN_COLUMNS: &str =
    "membership_json, counter_attested_json, nonce, version, updated_at";

fn foreign_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredForeignMembership> {
    let membership: String = row.get(0)?;
    let bundle: String = row.get(1)?;
    Ok(StoredForeignMembership {
        membership: json_column(0, &membership)?,
        counter_attested: json_column(1, &bundle)?,
        nonce: row.get(2)?,
        version: row.get(3)?,
        updated_at: row.get(4)?,
    })
}

/// The current record for `security_domain`, if any.
pub fn get_foreign_membership(
    conn: &Connection,
    security_domain: &str,
) -> Result<Option<StoredForeignMembership>, MembershipDbError> {
    let record = conn
        .query_row(
            &format!("SELECT {FOREIGN_COLUMNS} FROM foreign_memberships WHERE security_domain = ?1"),
            [security_domain],
            foreign_from_row,
        )
        .optional()?;
    Ok(record)
}

/// Every recorded foreign membership, ordered by domain.
pub fn list_foreign_memberships(
    conn: &Connection,
) -> Result<Vec<StoredForeignMembership>, MembershipDbError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {FOREIGN_COLUMNS} FROM foreign_memberships ORDER BY security_domain"
    ))?;
    let rows = stmt.query_map([], foreign_from_row)?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

/// Recorded versions of one domain's membership, oldest first.
pub fn membership_history(
    conn: &Connection,
    security_domain: &str,
) -> Result<Vec<HistoryEntry>, MembershipDbError> {
    let mut stmt = conn.prepare(
        "SELECT nonce, version, membership_json, recorded_at
         FROM membership_history
         WHERE security_domain = ?1
         ORDER BY version",
    )?;
    let rows = stmt.query_map([security_domain], |row| {
        let raw: String = row.get(2)?;
        Ok(HistoryEntry {
            nonce: row.get(0)?,
            version: row.get(1)?,
            membership: json_column(2, &raw)?,
            recorded_at: row.get(3)?,
        })
    })?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}
