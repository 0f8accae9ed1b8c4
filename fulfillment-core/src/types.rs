//! Core types for the fulfillment ledger
//!
//! All records are designed for:
//! - Deterministic serialization (bincode in the store, JSON at the edges)
//! - Integer quantities (animals are counted, never measured)
//! - Stable identities (UUIDv7, protocol strings)

use crate::{Error, Result};
use chrono::{DateTime, NaiveDate, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::fmt;
use uuid::Uuid;

/// Requisition protocol, `NNNNN.YYYY`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Protocol(String);

impl Protocol {
    /// Parse and validate a protocol string
    pub fn parse(s: &str) -> Result<Self> {
        let malformed = || Error::Validation(format!("Malformed protocol: {:?}", s));

        let (serial, year) = s.split_once('.').ok_or_else(malformed)?;
        let digits = |part: &str, len: usize| {
            part.len() == len && part.bytes().all(|b| b.is_ascii_digit())
        };

        if !digits(serial, 5) || !digits(year, 4) {
            return Err(malformed());
        }

        Ok(Self(s.to_string()))
    }

    /// Draw a random protocol for the given year
    ///
    /// Uniqueness is the caller's concern: generation is retried against
    /// the store until an unused protocol comes up.
    pub fn generate<R: Rng + ?Sized>(rng: &mut R, year: i32) -> Self {
        let serial: u32 = rng.gen_range(0..100_000);
        Self(format!("{:05}.{:04}", serial, year))
    }

    /// Get as string
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Year component
    pub fn year(&self) -> i32 {
        self.0
            .get(6..)
            .and_then(|year| year.parse().ok())
            .unwrap_or_default()
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Requisition: a request for animals, tracked to fulfillment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Requisition {
    /// Unique requisition ID
    pub id: Uuid,

    /// Protocol, assigned once at creation
    pub protocol: Protocol,

    /// Requested date
    pub date: NaiveDate,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,

    /// Last update timestamp
    pub last_updated: DateTime<Utc>,

    /// Required males
    pub required_males: u32,

    /// Required females
    pub required_females: u32,

    /// Attached tag names
    pub tags: BTreeSet<String>,

    /// Owning project
    pub project_id: Uuid,

    /// Requester (the project's author at creation)
    pub author: Option<Uuid>,

    /// Free-form notes from the requester
    pub author_notes: String,
}

/// One fulfillment event against a requisition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delivery {
    /// Unique delivery ID
    pub id: Uuid,

    /// Requisition this delivery belongs to
    pub requisition_id: Uuid,

    /// Delivery date
    pub date: NaiveDate,

    /// Recording timestamp
    pub timestamp: DateTime<Utc>,

    /// Who recorded the delivery
    pub author: Option<Uuid>,

    /// Males delivered
    pub males: u32,

    /// Females delivered
    pub females: u32,

    /// Notes
    pub notes: String,

    /// Inactive deliveries are soft-deleted and count for nothing
    pub active: bool,
}

impl Delivery {
    /// Inactive zero-quantity delivery created alongside every requisition
    pub fn placeholder(requisition_id: Uuid, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::now_v7(),
            requisition_id,
            date: now.date_naive(),
            timestamp: now,
            author: None,
            males: 0,
            females: 0,
            notes: "Delivery initialization.".to_string(),
            active: false,
        }
    }
}

/// Status codes, exchanged as stable two-letter codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StatusCode {
    /// Received
    #[serde(rename = "RE")]
    Received,
    /// In production (legacy)
    #[serde(rename = "PR")]
    InProduction,
    /// Concluded (fulfilled)
    #[serde(rename = "CO")]
    Concluded,
    /// Partially concluded
    #[serde(rename = "PA")]
    PartiallyConcluded,
    /// Suspended
    #[serde(rename = "SU")]
    Suspended,
    /// Cancelled
    #[serde(rename = "CA")]
    Cancelled,
}

impl StatusCode {
    /// Two-letter code
    pub fn code(&self) -> &'static str {
        match self {
            StatusCode::Received => "RE",
            StatusCode::InProduction => "PR",
            StatusCode::Concluded => "CO",
            StatusCode::PartiallyConcluded => "PA",
            StatusCode::Suspended => "SU",
            StatusCode::Cancelled => "CA",
        }
    }

    /// Parse from two-letter code
    pub fn from_code(s: &str) -> Option<Self> {
        match s {
            "RE" => Some(StatusCode::Received),
            "PR" => Some(StatusCode::InProduction),
            "CO" => Some(StatusCode::Concluded),
            "PA" => Some(StatusCode::PartiallyConcluded),
            "SU" => Some(StatusCode::Suspended),
            "CA" => Some(StatusCode::Cancelled),
            _ => None,
        }
    }

    /// Human readable label
    pub fn label(&self) -> &'static str {
        match self {
            StatusCode::Received => "Received",
            StatusCode::InProduction => "In production",
            StatusCode::Concluded => "Concluded",
            StatusCode::PartiallyConcluded => "Partially concluded",
            StatusCode::Suspended => "Suspended",
            StatusCode::Cancelled => "Cancelled",
        }
    }

    /// Manually set states that block automatic reconciliation
    pub fn is_hold(&self) -> bool {
        matches!(self, StatusCode::Suspended | StatusCode::Cancelled)
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Append-only status history entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusEvent {
    /// Unique event ID
    pub id: Uuid,

    /// Requisition this event belongs to
    pub requisition_id: Uuid,

    /// Position in the requisition's history
    pub sequence: u64,

    /// Status entered
    pub status: StatusCode,

    /// Message
    pub message: String,

    /// Event timestamp
    pub timestamp: DateTime<Utc>,

    /// Author (None for automatic transitions)
    pub author: Option<Uuid>,
}

/// Tag colour palette
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[allow(missing_docs)]
pub enum TagColor {
    Slate,
    Gray,
    Zinc,
    Neutral,
    Stone,
    Red,
    Orange,
    Amber,
    Yellow,
    Lime,
    Green,
    Emerald,
    Teal,
    Cyan,
    Sky,
    #[default]
    Blue,
    Indigo,
    Violet,
    Purple,
    Fuchsia,
    Pink,
    Rose,
}

/// Named label, unique by name, shared between requisitions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    /// Unique name
    pub name: String,

    /// Description
    pub description: String,

    /// URL-safe slug
    pub slug: String,

    /// Display colour
    pub color: TagColor,
}

impl Tag {
    /// Maximum slug length
    pub const SLUG_MAX_LEN: usize = 16;

    /// Create tag with derived slug and default colour
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let slug = slugify(&name, Self::SLUG_MAX_LEN);
        Self {
            name,
            description: String::new(),
            slug,
            color: TagColor::default(),
        }
    }

    /// Create tag whose slug is not in `taken`, numbered `-2`, `-3`, ... on collision
    pub fn with_unique_slug(name: impl Into<String>, taken: &HashSet<String>) -> Self {
        let mut tag = Self::new(name);
        let base = tag.slug.clone();
        let mut n = 2usize;
        while taken.contains(&tag.slug) {
            let suffix = format!("-{}", n);
            let stem: String = base
                .chars()
                .take(Self::SLUG_MAX_LEN.saturating_sub(suffix.len()))
                .collect();
            tag.slug = format!("{}{}", stem.trim_end_matches('-'), suffix);
            n += 1;
        }
        tag
    }
}

/// Institute
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Institute {
    /// Unique ID
    pub id: Uuid,
    /// Full name
    pub name: String,
    /// Abbreviation, used as the statistics key
    pub abbreviation: String,
    /// Description
    pub description: String,
}

impl Institute {
    /// Create institute; a blank abbreviation becomes the name's initials
    pub fn new(name: impl Into<String>, abbreviation: Option<String>) -> Self {
        let name = name.into();
        let abbreviation = abbreviation
            .filter(|a| !a.trim().is_empty())
            .unwrap_or_else(|| initials(&name));
        Self {
            id: Uuid::now_v7(),
            name,
            abbreviation,
            description: String::new(),
        }
    }
}

/// Department of an institute
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Department {
    /// Unique ID
    pub id: Uuid,
    /// Name
    pub name: String,
    /// Owning institute
    pub institute_id: Uuid,
    /// Description
    pub description: String,
}

/// Person: requester, advisor or staff
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    /// Unique ID
    pub id: Uuid,
    /// Display name
    pub name: String,
    /// Can advise projects
    pub is_advisor: bool,
    /// Institute
    pub institute_id: Option<Uuid>,
    /// Department
    pub department_id: Option<Uuid>,
    /// Phone
    pub phone: Option<String>,
    /// Hidden from listings
    pub is_hidden: bool,
}

/// Research project requisitions are filed under
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    /// Unique ID
    pub id: Uuid,
    /// Title
    pub title: String,
    /// Description
    pub description: String,
    /// Ethics committee (CEUA) protocol
    pub ceua_protocol: String,
    /// Unique slug
    pub slug: String,
    /// Author (requester)
    pub author: Uuid,
    /// Advisor
    pub advisor: Uuid,
}

impl Project {
    /// Maximum slug length, suffix included
    pub const SLUG_MAX_LEN: usize = 50;

    /// Slug from title plus a random six-digit suffix
    pub fn generate_slug<R: Rng + ?Sized>(rng: &mut R, title: &str) -> String {
        let suffix: u32 = rng.gen_range(0..1_000_000);
        let base = slugify(title, Self::SLUG_MAX_LEN - 7);
        format!("{}-{:06}", base, suffix)
    }
}

/// Lower-case ASCII slug, words joined by `-`, truncated to `max_len`
pub fn slugify(text: &str, max_len: usize) -> String {
    let mut slug = String::with_capacity(text.len());
    for c in text.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if (c.is_whitespace() || c == '-' || c == '_') && !slug.ends_with('-') {
            slug.push('-');
        }
    }

    let slug = slug.trim_matches('-');
    slug.chars().take(max_len).collect::<String>().trim_end_matches('-').to_string()
}

fn initials(name: &str) -> String {
    name.split_whitespace()
        .filter_map(|word| word.chars().next())
        .flat_map(char::to_uppercase)
        .collect()
}
