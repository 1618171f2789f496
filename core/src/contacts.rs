use std::collections::HashMap;
use std::path::{Path, PathBuf};

use rusqlite::{params, Connection, OpenFlags};

use crate::backup_paths::address_book_path;
use crate::collaborators::{ContactMatch, ContactsSource, MatchType};
use crate::error::CoreError;
use crate::models::Contact;

/// Phone numbers are compared on their trailing digits so `+1 (555) 000-1111`
/// and `5550001111` land on the same key.
const PHONE_MATCH_DIGITS: usize = 10;
const MIN_PHONE_DIGITS: usize = 3;

const AB_PROPERTY_PHONE: i64 = 3;
const AB_PROPERTY_EMAIL: i64 = 4;

pub fn normalize_phone(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    let digits: String = trimmed.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.len() < MIN_PHONE_DIGITS {
        return None;
    }
    if trimmed.starts_with('+') {
        Some(format!("+{}", digits))
    } else {
        Some(digits)
    }
}

pub fn normalize_email(raw: &str) -> Option<String> {
    let email = raw.trim().to_lowercase();
    let at = email.find('@')?;
    if at == 0 || at == email.len() - 1 {
        return None;
    }
    Some(email)
}

fn phone_key(normalized: &str) -> String {
    let digits: Vec<char> = normalized.chars().filter(|c| c.is_ascii_digit()).collect();
    let start = digits.len().saturating_sub(PHONE_MATCH_DIGITS);
    digits[start..].iter().collect()
}

pub fn display_name(contact: &Contact) -> Option<&str> {
    contact
        .display_name
        .as_deref()
        .or(contact.organization.as_deref())
        .filter(|name| !name.trim().is_empty())
}

/// Handle → contact lookup built once per sync.
#[derive(Debug, Default, Clone)]
pub struct ContactIndex {
    contacts: Vec<Contact>,
    by_phone: HashMap<String, usize>,
    by_email: HashMap<String, usize>,
}

impl ContactIndex {
    pub fn new(contacts: Vec<Contact>) -> Self {
        let mut by_phone = HashMap::new();
        let mut by_email = HashMap::new();
        for (idx, contact) in contacts.iter().enumerate() {
            for phone in &contact.phones {
                if let Some(normalized) = normalize_phone(phone) {
                    by_phone.entry(phone_key(&normalized)).or_insert(idx);
                }
            }
            for email in &contact.emails {
                if let Some(normalized) = normalize_email(email) {
                    by_email.entry(normalized).or_insert(idx);
                }
            }
        }
        Self {
            contacts,
            by_phone,
            by_email,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.contacts.is_empty()
    }

    pub fn contacts(&self) -> &[Contact] {
        &self.contacts
    }

    pub fn lookup(&self, handle: &str) -> Option<(&Contact, MatchType)> {
        if handle.contains('@') {
            let key = normalize_email(handle)?;
            return self.by_email.get(&key).map(|idx| (&self.contacts[*idx], MatchType::Email));
        }
        let normalized = normalize_phone(handle)?;
        self.by_phone
            .get(&phone_key(&normalized))
            .map(|idx| (&self.contacts[*idx], MatchType::Phone))
    }

    pub fn lookup_match(&self, handle: &str) -> Option<ContactMatch> {
        self.lookup(handle).map(|(contact, match_type)| ContactMatch {
            contact: contact.clone(),
            match_type,
        })
    }
}

/// Reads contacts from the AddressBook database stored in the backup.
#[derive(Default)]
pub struct AddressBookContacts {
    conn: Option<Connection>,
    path: Option<PathBuf>,
    index: ContactIndex,
}

impl AddressBookContacts {
    pub fn new() -> Self {
        Self::default()
    }

    fn read_contacts(conn: &Connection) -> Result<Vec<Contact>, CoreError> {
        let mut people: Vec<Contact> = Vec::new();
        let mut positions: HashMap<i64, usize> = HashMap::new();
        let mut person_stmt = conn.prepare("SELECT ROWID, First, Last, Organization FROM ABPerson ORDER BY ROWID;")?;
        let rows = person_stmt.query_map([], |row| {
            let id: i64 = row.get(0)?;
            let first: Option<String> = row.get(1)?;
            let last: Option<String> = row.get(2)?;
            let organization: Option<String> = row.get(3)?;
            Ok((id, first, last, organization))
        })?;
        for row in rows {
            let (id, first, last, organization) = row?;
            let name = [first, last]
                .into_iter()
                .flatten()
                .map(|part| part.trim().to_string())
                .filter(|part| !part.is_empty())
                .collect::<Vec<_>>()
                .join(" ");
            positions.insert(id, people.len());
            people.push(Contact {
                record_id: id.to_string(),
                display_name: if name.is_empty() { None } else { Some(name) },
                organization: organization.filter(|o| !o.trim().is_empty()),
                phones: Vec::new(),
                emails: Vec::new(),
            });
        }

        let mut value_stmt = conn.prepare(
            "SELECT record_id, property, value FROM ABMultiValue WHERE property IN (?1, ?2) ORDER BY UID;",
        )?;
        let values = value_stmt.query_map(params![AB_PROPERTY_PHONE, AB_PROPERTY_EMAIL], |row| {
            let record_id: i64 = row.get(0)?;
            let property: i64 = row.get(1)?;
            let value: Option<String> = row.get(2)?;
            Ok((record_id, property, value))
        })?;
        for value in values {
            let (record_id, property, value) = value?;
            let (Some(idx), Some(value)) = (positions.get(&record_id), value) else {
                continue;
            };
            let contact = &mut people[*idx];
            match property {
                AB_PROPERTY_PHONE => {
                    if let Some(phone) = normalize_phone(&value) {
                        if !contact.phones.contains(&phone) {
                            contact.phones.push(phone);
                        }
                    }
                }
                AB_PROPERTY_EMAIL => {
                    if let Some(email) = normalize_email(&value) {
                        if !contact.emails.contains(&email) {
                            contact.emails.push(email);
                        }
                    }
                }
                _ => {}
            }
        }
        Ok(people)
    }
}

impl ContactsSource for AddressBookContacts {
    /// Accepts either a backup root or the AddressBook database file itself.
    fn open(&mut self, backup_path: &Path) -> Result<(), CoreError> {
        self.close();
        let db_path = if backup_path.is_file() {
            backup_path.to_path_buf()
        } else {
            address_book_path(backup_path)
        };
        if !db_path.exists() {
            return Err(CoreError::InvalidArgument("address book not found in backup".to_string()));
        }
        let conn = Connection::open_with_flags(&db_path, OpenFlags::SQLITE_OPEN_READ_ONLY)?;
        let contacts = Self::read_contacts(&conn)?;
        log::debug!("address book opened with {} contacts", contacts.len());
        self.index = ContactIndex::new(contacts);
        self.conn = Some(conn);
        self.path = Some(db_path);
        Ok(())
    }

    fn get_all_contacts(&self) -> Result<Vec<Contact>, CoreError> {
        if self.conn.is_none() {
            return Err(CoreError::NotOpen);
        }
        Ok(self.index.contacts().to_vec())
    }

    fn lookup_by_handle(&self, handle: &str) -> Option<ContactMatch> {
        self.index.lookup_match(handle)
    }

    fn close(&mut self) {
        if let Some(conn) = self.conn.take() {
            let _ = conn.close();
        }
        self.path = None;
        self.index = ContactIndex::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn alice() -> Contact {
        Contact {
            record_id: "1".to_string(),
            display_name: Some("Alice Smith".to_string()),
            organization: None,
            phones: vec!["+1 (555) 000-1111".to_string()],
            emails: vec!["Alice@Example.com".to_string()],
        }
    }

    #[test]
    fn normalizes_phone_and_email() {
        assert_eq!(normalize_phone("+1 (555) 000-1111").as_deref(), Some("+15550001111"));
        assert_eq!(normalize_phone("555.000.1111").as_deref(), Some("5550001111"));
        assert_eq!(normalize_phone("12"), None);
        assert_eq!(normalize_email("  Bob@Example.COM ").as_deref(), Some("bob@example.com"));
        assert_eq!(normalize_email("@nope"), None);
    }

    #[test]
    fn index_matches_phone_suffix_and_email_case() {
        let index = ContactIndex::new(vec![alice()]);
        let (contact, kind) = index.lookup("5550001111").expect("phone match");
        assert_eq!(contact.record_id, "1");
        assert_eq!(kind, MatchType::Phone);
        let (_, kind) = index.lookup("alice@example.com").expect("email match");
        assert_eq!(kind, MatchType::Email);
        assert!(index.lookup("+15559999999").is_none());
        assert!(index.lookup("").is_none());
    }

    #[test]
    fn address_book_reads_people_and_values() {
        let dir = tempdir().expect("temp");
        let db_path = dir.path().join("AddressBook.sqlitedb");
        let conn = Connection::open(&db_path).expect("db");
        conn.execute_batch(
            "CREATE TABLE ABPerson (ROWID INTEGER PRIMARY KEY, First TEXT, Last TEXT, Organization TEXT);
             CREATE TABLE ABMultiValue (UID INTEGER PRIMARY KEY, record_id INTEGER, property INTEGER, value TEXT);
             INSERT INTO ABPerson VALUES (1, 'Alice', 'Smith', NULL);
             INSERT INTO ABPerson VALUES (2, NULL, NULL, 'Plumbing Co');
             INSERT INTO ABMultiValue VALUES (1, 1, 3, '+1 555 000 1111');
             INSERT INTO ABMultiValue VALUES (2, 1, 4, 'ALICE@example.com');
             INSERT INTO ABMultiValue VALUES (3, 2, 3, '555-222-3333');
             INSERT INTO ABMultiValue VALUES (4, 2, 22, 'ignored');",
        )
        .expect("schema");
        drop(conn);

        let mut source = AddressBookContacts::new();
        assert!(matches!(source.get_all_contacts(), Err(CoreError::NotOpen)));
        source.open(&db_path).expect("open");
        let contacts = source.get_all_contacts().expect("contacts");
        assert_eq!(contacts.len(), 2);
        assert_eq!(contacts[0].display_name.as_deref(), Some("Alice Smith"));
        assert_eq!(contacts[0].emails, vec!["alice@example.com".to_string()]);
        assert_eq!(display_name(&contacts[1]), Some("Plumbing Co"));

        let matched = source.lookup_by_handle("+15552223333").expect("match");
        assert_eq!(matched.contact.record_id, "2");
        source.close();
        assert!(source.lookup_by_handle("+15552223333").is_none());
    }
}
