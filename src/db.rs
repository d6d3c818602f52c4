use std::{fmt, str::FromStr};

use crate::{
    bson::Document,
    bson_util,
    cmap::Command,
    error::{CannotFormCommandReason, Error, ErrorKind, Result},
    Client,
    ClientSession,
    Cursor,
};

/// The maximum length in bytes of a database name.
const MAX_DATABASE_NAME_LENGTH: usize = 63;

/// A database-collection pair, rendered on the wire as `"db.coll"`.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Namespace {
    /// The name of the database associated with this namespace.
    pub db: String,

    /// The name of the collection this namespace corresponds to.
    pub coll: String,
}

impl Namespace {
    /// Creates a namespace, enforcing the server's naming rules: a non-empty database name of
    /// at most 63 bytes, and no `$` or NUL byte in either half.
    pub fn new(db: impl Into<String>, coll: impl Into<String>) -> Result<Self> {
        let db = db.into();
        let coll = coll.into();

        if db.is_empty() {
            return Err(Error::invalid_argument("database names must not be empty"));
        }
        if db.len() > MAX_DATABASE_NAME_LENGTH {
            return Err(Error::invalid_argument(format!(
                "database names must be at most {} bytes, got {}",
                MAX_DATABASE_NAME_LENGTH,
                db.len()
            )));
        }
        for (half, value) in [("database", &db), ("collection", &coll)] {
            if value.contains('$') || value.contains('\0') {
                return Err(Error::invalid_argument(format!(
                    "{} names must not contain '$' or NUL bytes: \"{}\"",
                    half,
                    value.escape_debug()
                )));
            }
        }

        Ok(Self { db, coll })
    }

    /// Splits a namespace string the server produced, e.g. the `cursor.ns` field of a reply.
    ///
    /// No validation is applied: server-generated namespaces legitimately contain `$` (for
    /// example `db.$cmd.listCollections`).
    pub(crate) fn from_wire(s: &str) -> Result<Self> {
        match s.split_once('.') {
            Some((db, coll)) if !db.is_empty() => Ok(Self {
                db: db.to_string(),
                coll: coll.to_string(),
            }),
            _ => Err(Error::invalid_response(format!(
                "\"{}\" is not a valid namespace",
                s
            ))),
        }
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "{}.{}", self.db, self.coll)
    }
}

impl FromStr for Namespace {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.split_once('.') {
            Some((db, coll)) => Self::new(db, coll),
            None => Err(Error::invalid_argument(format!(
                "namespaces have the form \"db.collection\", got \"{}\"",
                s
            ))),
        }
    }
}

/// A handle to a database on the server. `Database` is a thin view: a name plus the client it
/// belongs to.
#[derive(Clone, Debug)]
pub struct Database {
    client: Client,
    name: String,
}

impl Database {
    pub(crate) fn new(client: Client, name: &str) -> Self {
        Self {
            client,
            name: name.to_string(),
        }
    }

    /// The name of this database.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Runs an arbitrary command against this database and returns the reply document.
    ///
    /// The first key of `body` must be the command name. An implicit session is attached, so
    /// replies participate in the client's causal-consistency gossip.
    pub async fn run_command(&self, body: Document) -> Result<Document> {
        let command = self.build_command(body)?;
        let mut session = self.client.start_implicit_session().await;
        let response = self.client.execute_command(command, &mut session).await?;
        response.validate()?;
        Ok(response.body)
    }

    /// Runs an arbitrary command with the given session, attaching the session's transaction
    /// metadata when one is active.
    pub async fn run_command_with_session(
        &self,
        body: Document,
        session: &mut ClientSession,
    ) -> Result<Document> {
        let command = self.build_command(body)?;
        let response = self.client.execute_command(command, session).await?;
        response.validate()?;
        Ok(response.body)
    }

    /// Runs a command whose reply opens a cursor (`find`, `aggregate`, `listCollections`,
    /// change streams, ...) and returns a [`Cursor`] streaming its documents.
    pub async fn run_cursor_command(&self, body: Document) -> Result<Cursor> {
        let mut command = self.build_command(body)?;
        command.supports_read_concern = true;
        self.client.execute_cursor_command(command).await
    }

    fn build_command(&self, body: Document) -> Result<Command> {
        let name = match bson_util::first_key(&body) {
            Some(name) => name.to_string(),
            None => {
                return Err(ErrorKind::CannotFormCommand {
                    reason: CannotFormCommandReason::NothingToDo,
                }
                .into())
            }
        };

        Ok(Command::new(name, self.name.clone(), body))
    }
}

#[cfg(test)]
mod test {
    use std::str::FromStr;

    use super::Namespace;

    #[test]
    fn namespace_validation() {
        assert!(Namespace::new("db", "coll").is_ok());
        assert!(Namespace::new("", "coll").is_err());
        assert!(Namespace::new("db$", "coll").is_err());
        assert!(Namespace::new("db", "co\0ll").is_err());
        assert!(Namespace::new("d".repeat(64), "coll").is_err());
        assert!(Namespace::new("d".repeat(63), "coll").is_ok());
    }

    #[test]
    fn namespace_round_trips_through_display() {
        let ns = Namespace::from_str("db.coll.with.dots").unwrap();
        assert_eq!(ns.db, "db");
        assert_eq!(ns.coll, "coll.with.dots");
        assert_eq!(ns.to_string(), "db.coll.with.dots");
    }

    #[test]
    fn wire_namespaces_are_not_validated() {
        let ns = Namespace::from_wire("db.$cmd.listCollections").unwrap();
        assert_eq!(ns.coll, "$cmd.listCollections");
        assert!(Namespace::from_wire("nodot").is_err());
    }
}
