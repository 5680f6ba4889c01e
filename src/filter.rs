//! Composable appointment predicates. Ledger queries are built from explicit
//! `(field, comparator, value)` triples combined with `All` / `Any`, so a backing
//! store can translate them without ever seeing a raw query fragment.

use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::model::{Appointment, AppointmentStatus, Ms, Span};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Field {
    Id,
    BranchId,
    StaffId,
    /// Matches the primary staff member or anyone performing one of the items.
    Performer,
    CustomerId,
    Status,
    Start,
    End,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Comparator {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    In,
    NotIn,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Value {
    Id(Ulid),
    Time(Ms),
    Status(AppointmentStatus),
    Statuses(Vec<AppointmentStatus>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Predicate {
    pub field: Field,
    pub cmp: Comparator,
    pub value: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Filter {
    Pred(Predicate),
    All(Vec<Filter>),
    Any(Vec<Filter>),
}

impl Predicate {
    pub fn new(field: Field, cmp: Comparator, value: Value) -> Self {
        Self { field, cmp, value }
    }

    pub fn matches(&self, a: &Appointment) -> bool {
        match (self.field, &self.value) {
            (Field::Id, Value::Id(v)) => compare_eq(self.cmp, &a.id, v),
            (Field::BranchId, Value::Id(v)) => compare_eq(self.cmp, &a.branch_id, v),
            (Field::StaffId, Value::Id(v)) => compare_eq(self.cmp, &a.staff_id, v),
            (Field::Performer, Value::Id(v)) => compare_eq(self.cmp, &a.performed_by(*v), &true),
            (Field::CustomerId, Value::Id(v)) => compare_eq(self.cmp, &a.customer_id, v),
            (Field::Status, Value::Status(v)) => compare_eq(self.cmp, &a.status, v),
            (Field::Status, Value::Statuses(set)) => match self.cmp {
                Comparator::In => set.contains(&a.status),
                Comparator::NotIn => !set.contains(&a.status),
                _ => false,
            },
            (Field::Start, Value::Time(v)) => compare_ord(self.cmp, a.start, *v),
            (Field::End, Value::Time(v)) => compare_ord(self.cmp, a.end, *v),
            // Field/value type mismatch never matches.
            _ => false,
        }
    }
}

fn compare_eq<T: PartialEq>(cmp: Comparator, left: &T, right: &T) -> bool {
    match cmp {
        Comparator::Eq => left == right,
        Comparator::Ne => left != right,
        _ => false,
    }
}

fn compare_ord(cmp: Comparator, left: Ms, right: Ms) -> bool {
    match cmp {
        Comparator::Eq => left == right,
        Comparator::Ne => left != right,
        Comparator::Lt => left < right,
        Comparator::Le => left <= right,
        Comparator::Gt => left > right,
        Comparator::Ge => left >= right,
        Comparator::In | Comparator::NotIn => false,
    }
}

impl Filter {
    pub fn pred(field: Field, cmp: Comparator, value: Value) -> Self {
        Filter::Pred(Predicate::new(field, cmp, value))
    }

    pub fn matches(&self, a: &Appointment) -> bool {
        match self {
            Filter::Pred(p) => p.matches(a),
            Filter::All(fs) => fs.iter().all(|f| f.matches(a)),
            Filter::Any(fs) => fs.iter().any(|f| f.matches(a)),
        }
    }

    pub fn and(self, other: Filter) -> Filter {
        match self {
            Filter::All(mut fs) => {
                fs.push(other);
                Filter::All(fs)
            }
            f => Filter::All(vec![f, other]),
        }
    }

    pub fn staff(staff_id: Ulid) -> Self {
        Self::pred(Field::StaffId, Comparator::Eq, Value::Id(staff_id))
    }

    pub fn performer(staff_id: Ulid) -> Self {
        Self::pred(Field::Performer, Comparator::Eq, Value::Id(staff_id))
    }

    pub fn branch(branch_id: Ulid) -> Self {
        Self::pred(Field::BranchId, Comparator::Eq, Value::Id(branch_id))
    }

    pub fn not_id(id: Ulid) -> Self {
        Self::pred(Field::Id, Comparator::Ne, Value::Id(id))
    }

    /// Status not in {CANCELLED, NO_SHOW}.
    pub fn active() -> Self {
        Self::pred(
            Field::Status,
            Comparator::NotIn,
            Value::Statuses(vec![AppointmentStatus::Cancelled, AppointmentStatus::NoShow]),
        )
    }

    /// The three-way overlap test against target `t`:
    /// `(o.start <= t.start AND o.end > t.start)
    ///  OR (o.start < t.end AND o.end >= t.end)
    ///  OR (o.start >= t.start AND o.end <= t.end)`.
    ///
    /// For non-empty spans this is exactly half-open intersection.
    pub fn overlapping(t: Span) -> Self {
        use Comparator::*;
        let time = Value::Time;
        Filter::Any(vec![
            Filter::All(vec![
                Self::pred(Field::Start, Le, time(t.start)),
                Self::pred(Field::End, Gt, time(t.start)),
            ]),
            Filter::All(vec![
                Self::pred(Field::Start, Lt, time(t.end)),
                Self::pred(Field::End, Ge, time(t.end)),
            ]),
            Filter::All(vec![
                Self::pred(Field::Start, Ge, time(t.start)),
                Self::pred(Field::End, Le, time(t.end)),
            ]),
        ])
    }

    /// Active appointments occupying `staff_id` (as primary or item performer)
    /// that overlap `span`.
    pub fn staff_occupancy(staff_id: Ulid, span: Span) -> Self {
        Filter::All(vec![Self::performer(staff_id), Self::active(), Self::overlapping(span)])
    }
}
