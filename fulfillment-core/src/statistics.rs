//! Multi-dimensional fulfillment statistics
//!
//! Folds active deliveries into required-vs-delivered counters per
//! protocol, institute, department, advisor, author, project and tag.
//!
//! # Algorithm
//!
//! Single streaming pass over one [`LedgerSnapshot`]:
//!
//! 1. Resolve the delivery's dimension keys through
//!    requisition → project → author / advisor → institute / department
//! 2. Add the requisition's required quantities to every resolved bucket,
//!    once per distinct requisition (tracked in a `HashSet`)
//! 3. Add the delivered quantities to every resolved bucket, once per
//!    delivery row
//!
//! # Example
//!
//! ```text
//! Requisition 00001.2024 requires 10M / 5F
//!   delivery A: 4M 1F
//!   delivery B: 6M 2F
//!
//! by_total: required 10M 5F, delivered 10M 3F
//! ```

use crate::{
    storage::LedgerSnapshot,
    types::{Delivery, Requisition},
    Error, Result,
};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use uuid::Uuid;

/// Required vs. delivered counters of one bucket
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counters {
    /// Required males
    pub required_males: u64,
    /// Required females
    pub required_females: u64,
    /// Delivered males
    pub delivered_males: u64,
    /// Delivered females
    pub delivered_females: u64,
}

impl Counters {
    fn apply(&mut self, contribution: &Contribution) {
        if let Some((males, females)) = contribution.required {
            self.required_males += u64::from(males);
            self.required_females += u64::from(females);
        }
        self.delivered_males += u64::from(contribution.delivered.0);
        self.delivered_females += u64::from(contribution.delivered.1);
    }

    /// Delivered over required, both sexes together
    ///
    /// `None` when nothing is required.
    pub fn fulfillment_ratio(&self) -> Option<f64> {
        let required = self.required_males + self.required_females;
        if required == 0 {
            return None;
        }
        let delivered = self.delivered_males + self.delivered_females;
        Some(delivered as f64 / required as f64)
    }
}

/// What one delivery adds to each bucket it resolves to
struct Contribution {
    /// Required quantities, present only on a requisition's first delivery
    required: Option<(u32, u32)>,
    delivered: (u32, u32),
}

/// Inclusive delivery-date window; absent bounds are unbounded
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    /// First day included
    pub from: Option<NaiveDate>,
    /// Last day included
    pub to: Option<NaiveDate>,
}

impl DateRange {
    /// Create range, rejecting `from > to`
    pub fn new(from: Option<NaiveDate>, to: Option<NaiveDate>) -> Result<Self> {
        if let (Some(from), Some(to)) = (from, to) {
            if from > to {
                return Err(Error::Validation(format!(
                    "Date range starts after it ends: {} > {}",
                    from, to
                )));
            }
        }
        Ok(Self { from, to })
    }

    /// Range with no bounds
    pub fn unbounded() -> Self {
        Self::default()
    }

    /// True if `date` falls inside the range
    pub fn contains(&self, date: NaiveDate) -> bool {
        self.from.map_or(true, |from| date >= from) && self.to.map_or(true, |to| date <= to)
    }
}

/// How broken ownership chains are handled
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregationMode {
    /// Report broken records alongside partial results
    #[default]
    Lenient,
    /// Abort on the first broken record
    Strict,
}

/// Link missing from a delivery's ownership chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[allow(missing_docs)]
pub enum MissingLink {
    Requisition,
    Project,
    Author,
    Advisor,
    Institute,
    Department,
}

impl fmt::Display for MissingLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MissingLink::Requisition => "requisition",
            MissingLink::Project => "project",
            MissingLink::Author => "author",
            MissingLink::Advisor => "advisor",
            MissingLink::Institute => "institute",
            MissingLink::Department => "department",
        };
        write!(f, "{}", name)
    }
}

/// Delivery whose ownership chain could not be fully resolved
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncompleteRecord {
    /// Delivery
    pub delivery_id: Uuid,
    /// Requisition it points at
    pub requisition_id: Uuid,
    /// Protocol, when the requisition resolved
    pub protocol: Option<String>,
    /// Links that were missing
    pub missing: Vec<MissingLink>,
}

impl fmt::Display for IncompleteRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let missing: Vec<String> = self.missing.iter().map(ToString::to_string).collect();
        write!(
            f,
            "delivery {} (requisition {}): missing {}",
            self.delivery_id,
            self.protocol
                .clone()
                .unwrap_or_else(|| self.requisition_id.to_string()),
            missing.join(", ")
        )
    }
}

/// Aggregate report
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregateReport {
    /// Totals over every counted delivery
    pub by_total: Counters,
    /// Keyed by protocol
    pub by_protocol: BTreeMap<String, Counters>,
    /// Keyed by institute abbreviation
    pub by_institute: BTreeMap<String, Counters>,
    /// Keyed by `"<department> (<institute abbreviation>)"`
    pub by_department: BTreeMap<String, Counters>,
    /// Keyed by advisor name
    pub by_advisor: BTreeMap<String, Counters>,
    /// Keyed by author name
    pub by_author: BTreeMap<String, Counters>,
    /// Keyed by project title
    pub by_project: BTreeMap<String, Counters>,
    /// Keyed by tag name
    pub by_tags: BTreeMap<String, Counters>,
    /// Broken records (lenient mode)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<IncompleteRecord>,
}

fn bump(map: &mut BTreeMap<String, Counters>, key: Option<&str>, contribution: &Contribution) {
    if let Some(key) = key {
        map.entry(key.to_string())
            .or_default()
            .apply(contribution);
    }
}

/// Dimension keys of one delivery
#[derive(Default)]
struct DimensionKeys<'a> {
    requisition: Option<&'a Requisition>,
    project: Option<String>,
    author: Option<String>,
    advisor: Option<String>,
    institute: Option<String>,
    department: Option<String>,
    missing: Vec<MissingLink>,
}

fn resolve<'a>(snapshot: &'a LedgerSnapshot, delivery: &Delivery) -> DimensionKeys<'a> {
    let mut keys = DimensionKeys::default();

    let Some(requisition) = snapshot.requisitions.get(&delivery.requisition_id) else {
        keys.missing.push(MissingLink::Requisition);
        return keys;
    };
    keys.requisition = Some(requisition);

    let Some(project) = snapshot.projects.get(&requisition.project_id) else {
        keys.missing.push(MissingLink::Project);
        return keys;
    };
    keys.project = Some(project.title.clone());

    match snapshot.profiles.get(&project.author) {
        Some(author) => keys.author = Some(author.name.clone()),
        None => keys.missing.push(MissingLink::Author),
    }

    let Some(advisor) = snapshot.profiles.get(&project.advisor) else {
        keys.missing.push(MissingLink::Advisor);
        return keys;
    };
    keys.advisor = Some(advisor.name.clone());

    let institute = advisor
        .institute_id
        .and_then(|id| snapshot.institutes.get(&id));
    match institute {
        Some(institute) => keys.institute = Some(institute.abbreviation.clone()),
        None => keys.missing.push(MissingLink::Institute),
    }

    let department = advisor
        .department_id
        .and_then(|id| snapshot.departments.get(&id));
    match (department, institute) {
        (Some(department), Some(institute)) => {
            keys.department = Some(format!("{} ({})", department.name, institute.abbreviation));
        }
        (Some(_), None) => {}
        (None, _) => keys.missing.push(MissingLink::Department),
    }

    keys
}

/// Statistics aggregator
#[derive(Debug, Clone, Copy, Default)]
pub struct StatisticsAggregator {
    mode: AggregationMode,
}

impl StatisticsAggregator {
    /// Create aggregator
    pub fn new(mode: AggregationMode) -> Self {
        Self { mode }
    }

    /// Aggregate the active deliveries of `snapshot` dated inside `range`
    pub fn aggregate(
        &self,
        snapshot: &LedgerSnapshot,
        range: &DateRange,
    ) -> Result<AggregateReport> {
        let mut report = AggregateReport::default();
        let mut counted: HashSet<Uuid> = HashSet::new();
        let mut deliveries = 0usize;

        for delivery in snapshot
            .deliveries
            .iter()
            .filter(|d| d.active && range.contains(d.date))
        {
            deliveries += 1;
            let keys = resolve(snapshot, delivery);

            if !keys.missing.is_empty() {
                let record = IncompleteRecord {
                    delivery_id: delivery.id,
                    requisition_id: delivery.requisition_id,
                    protocol: keys.requisition.map(|r| r.protocol.to_string()),
                    missing: keys.missing.clone(),
                };

                match self.mode {
                    AggregationMode::Strict => {
                        return Err(Error::IncompleteRecord(record.to_string()));
                    }
                    AggregationMode::Lenient => {
                        tracing::warn!(
                            delivery_id = %record.delivery_id,
                            missing = ?record.missing,
                            "Delivery with broken ownership chain"
                        );
                        report.errors.push(record);
                    }
                }
            }

            let required = keys
                .requisition
                .filter(|r| counted.insert(r.id))
                .map(|r| (r.required_males, r.required_females));
            let contribution = Contribution {
                required,
                delivered: (delivery.males, delivery.females),
            };

            report.by_total.apply(&contribution);

            let Some(requisition) = keys.requisition else {
                continue;
            };

            bump(
                &mut report.by_protocol,
                Some(requisition.protocol.as_str()),
                &contribution,
            );

            // Broken chains stay out of the ownership dimensions
            if !keys.missing.is_empty() {
                continue;
            }

            bump(&mut report.by_institute, keys.institute.as_deref(), &contribution);
            bump(&mut report.by_department, keys.department.as_deref(), &contribution);
            bump(&mut report.by_advisor, keys.advisor.as_deref(), &contribution);
            bump(&mut report.by_author, keys.author.as_deref(), &contribution);
            bump(&mut report.by_project, keys.project.as_deref(), &contribution);
            for tag in &requisition.tags {
                bump(&mut report.by_tags, Some(tag.as_str()), &contribution);
            }
        }

        tracing::debug!(
            deliveries,
            requisitions = counted.len(),
            incomplete = report.errors.len(),
            "Statistics aggregated"
        );

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Department, Institute, Profile, Project, Protocol};
    use chrono::Utc;
    use std::collections::BTreeSet;

    struct Fixture {
        snapshot: LedgerSnapshot,
        project_id: Uuid,
    }

    fn profile(name: &str, institute: Option<Uuid>, department: Option<Uuid>) -> Profile {
        Profile {
            id: Uuid::now_v7(),
            name: name.to_string(),
            is_advisor: institute.is_some(),
            institute_id: institute,
            department_id: department,
            phone: None,
            is_hidden: false,
        }
    }

    fn fixture() -> Fixture {
        let mut snapshot = LedgerSnapshot::default();

        let institute = Institute::new("Instituto de Biologia", Some("IB".into()));
        let department = Department {
            id: Uuid::now_v7(),
            name: "Genetics".into(),
            institute_id: institute.id,
            description: String::new(),
        };
        let advisor = profile("Dr. Silva", Some(institute.id), Some(department.id));
        let author = profile("Ana", None, None);
        let project = Project {
            id: Uuid::now_v7(),
            title: "Colony growth".into(),
            description: String::new(),
            ceua_protocol: "CEUA-7".into(),
            slug: "colony-growth-000001".into(),
            author: author.id,
            advisor: advisor.id,
        };

        let project_id = project.id;
        snapshot.institutes.insert(institute.id, institute);
        snapshot.departments.insert(department.id, department);
        snapshot.profiles.insert(advisor.id, advisor);
        snapshot.profiles.insert(author.id, author);
        snapshot.projects.insert(project.id, project);

        Fixture {
            snapshot,
            project_id,
        }
    }

    impl Fixture {
        fn requisition(&mut self, protocol: &str, males: u32, females: u32, tags: &[&str]) -> Uuid {
            let requisition = Requisition {
                id: Uuid::now_v7(),
                protocol: Protocol::parse(protocol).unwrap(),
                date: NaiveDate::from_ymd_opt(2024, 1, 10).unwrap(),
                created_at: Utc::now(),
                last_updated: Utc::now(),
                required_males: males,
                required_females: females,
                tags: tags.iter().map(|t| t.to_string()).collect::<BTreeSet<_>>(),
                project_id: self.project_id,
                author: None,
                author_notes: String::new(),
            };
            let id = requisition.id;
            self.snapshot.requisitions.insert(id, requisition);
            id
        }

        fn delivery(&mut self, requisition_id: Uuid, day: u32, males: u32, females: u32) -> Uuid {
            let delivery = Delivery {
                id: Uuid::now_v7(),
                requisition_id,
                date: NaiveDate::from_ymd_opt(2024, 2, day).unwrap(),
                timestamp: Utc::now(),
                author: None,
                males,
                females,
                notes: String::new(),
                active: true,
            };
            let id = delivery.id;
            self.snapshot.deliveries.push(delivery);
            id
        }

        fn aggregate(&self) -> AggregateReport {
            StatisticsAggregator::default()
                .aggregate(&self.snapshot, &DateRange::unbounded())
                .unwrap()
        }
    }

    #[test]
    fn test_required_counted_once_per_requisition() {
        let mut fx = fixture();
        let req = fx.requisition("00001.2024", 10, 5, &["Received"]);
        fx.delivery(req, 1, 4, 1);
        fx.delivery(req, 2, 6, 2);

        let report = fx.aggregate();
        assert_eq!(report.by_total.required_males, 10);
        assert_eq!(report.by_total.required_females, 5);
        assert_eq!(report.by_total.delivered_males, 10);
        assert_eq!(report.by_total.delivered_females, 3);

        let by_protocol = report.by_protocol["00001.2024"];
        assert_eq!(by_protocol, report.by_total);
        assert_eq!(report.by_tags["Received"], report.by_total);
    }

    #[test]
    fn test_dimension_keys() {
        let mut fx = fixture();
        let req = fx.requisition("00002.2024", 2, 2, &[]);
        fx.delivery(req, 1, 1, 1);

        let report = fx.aggregate();
        assert!(report.by_institute.contains_key("IB"));
        assert!(report.by_department.contains_key("Genetics (IB)"));
        assert!(report.by_advisor.contains_key("Dr. Silva"));
        assert!(report.by_author.contains_key("Ana"));
        assert!(report.by_project.contains_key("Colony growth"));
        assert!(report.by_tags.is_empty());
        assert!(report.errors.is_empty());
    }

    #[test]
    fn test_shared_dimension_sums_requisitions() {
        let mut fx = fixture();
        let first = fx.requisition("00003.2024", 10, 5, &["Mice"]);
        let second = fx.requisition("00004.2024", 4, 4, &["Mice", "Urgent"]);
        fx.delivery(first, 1, 10, 5);
        fx.delivery(second, 2, 1, 0);
        fx.delivery(second, 3, 1, 0);

        let report = fx.aggregate();
        let project = report.by_project["Colony growth"];
        assert_eq!(project.required_males, 14);
        assert_eq!(project.delivered_males, 12);
        assert_eq!(report.by_tags["Mice"].required_females, 9);
        assert_eq!(report.by_tags["Urgent"].required_females, 4);
        assert_eq!(report.by_tags["Urgent"].delivered_males, 2);
        assert_eq!(report.by_protocol.len(), 2);
    }

    #[test]
    fn test_inactive_and_out_of_range_excluded() {
        let mut fx = fixture();
        let req = fx.requisition("00005.2024", 10, 5, &[]);
        fx.delivery(req, 1, 3, 3);
        fx.delivery(req, 20, 4, 0);
        fx.snapshot.deliveries[0].active = false;

        let report = fx.aggregate();
        assert_eq!(report.by_total.delivered_males, 4);
        assert_eq!(report.by_total.required_males, 10);

        let range = DateRange::new(None, NaiveDate::from_ymd_opt(2024, 2, 10)).unwrap();
        let report = StatisticsAggregator::default()
            .aggregate(&fx.snapshot, &range)
            .unwrap();
        assert_eq!(report.by_total, Counters::default());
        assert!(report.by_protocol.is_empty());
    }

    #[test]
    fn test_date_range() {
        let day = |d| NaiveDate::from_ymd_opt(2024, 2, d).unwrap();
        let range = DateRange::new(Some(day(5)), Some(day(10))).unwrap();
        assert!(range.contains(day(5)));
        assert!(range.contains(day(10)));
        assert!(!range.contains(day(4)));
        assert!(!range.contains(day(11)));
        assert!(DateRange::unbounded().contains(day(1)));
        assert!(matches!(
            DateRange::new(Some(day(10)), Some(day(5))),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn test_lenient_mode_reports_broken_chain() {
        let mut fx = fixture();
        let req = fx.requisition("00006.2024", 10, 5, &["Rats"]);
        fx.delivery(req, 1, 2, 2);

        let advisor_id = fx.snapshot.projects[&fx.project_id].advisor;
        fx.snapshot.profiles.remove(&advisor_id);

        let report = fx.aggregate();
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].missing, vec![MissingLink::Advisor]);
        assert_eq!(report.errors[0].protocol.as_deref(), Some("00006.2024"));

        assert_eq!(report.by_total.delivered_males, 2);
        assert_eq!(report.by_protocol["00006.2024"].required_males, 10);
        assert!(report.by_tags.is_empty());
        assert!(report.by_project.is_empty());
        assert!(report.by_author.is_empty());
        assert!(report.by_advisor.is_empty());
        assert!(report.by_institute.is_empty());
        assert!(report.by_department.is_empty());
    }

    #[test]
    fn test_orphan_delivery_counts_in_total_only() {
        let mut fx = fixture();
        fx.delivery(Uuid::now_v7(), 1, 3, 1);

        let report = fx.aggregate();
        assert_eq!(report.errors[0].missing, vec![MissingLink::Requisition]);
        assert_eq!(report.by_total.delivered_males, 3);
        assert_eq!(report.by_total.required_males, 0);
        assert!(report.by_protocol.is_empty());
    }

    #[test]
    fn test_strict_mode_aborts() {
        let mut fx = fixture();
        let req = fx.requisition("00007.2024", 1, 1, &[]);
        fx.delivery(req, 1, 1, 1);
        fx.snapshot.projects.clear();

        let err = StatisticsAggregator::new(AggregationMode::Strict)
            .aggregate(&fx.snapshot, &DateRange::unbounded())
            .unwrap_err();
        assert!(matches!(err, Error::IncompleteRecord(ref msg) if msg.contains("project")));
    }

    #[test]
    fn test_fulfillment_ratio() {
        let counters = Counters {
            required_males: 10,
            required_females: 10,
            delivered_males: 10,
            delivered_females: 5,
        };
        assert_eq!(counters.fulfillment_ratio(), Some(0.75));
        assert_eq!(Counters::default().fulfillment_ratio(), None);
    }

    #[test]
    fn test_report_json_shape() {
        let mut fx = fixture();
        let req = fx.requisition("00008.2024", 1, 0, &[]);
        fx.delivery(req, 1, 1, 0);

        let json = serde_json::to_value(fx.aggregate()).unwrap();
        assert_eq!(json["by_total"]["required_males"], 1);
        assert_eq!(json["by_protocol"]["00008.2024"]["delivered_males"], 1);
        assert!(json.get("errors").is_none());
    }
}
