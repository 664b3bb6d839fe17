use std::cmp::Reverse;

use crate::lifecycle::{effective_status, EffectiveStatus};
use crate::model::{Appointment, Ms};

/// An appointment with its status classified against one `now` snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classified {
    pub appointment: Appointment,
    pub effective: EffectiveStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bucket {
    Upcoming,
    Past,
}

impl Bucket {
    pub fn as_str(self) -> &'static str {
        match self {
            Bucket::Upcoming => "upcoming",
            Bucket::Past => "past",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "upcoming" => Some(Bucket::Upcoming),
            "past" => Some(Bucket::Past),
            _ => None,
        }
    }
}

/// A claimant's appointments split by effective status.
///
/// `upcoming` is soonest first, `past` most recent first. Ties on the date
/// fall back to the id so repeated renders are identical.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Partition {
    pub now: Ms,
    pub upcoming: Vec<Classified>,
    pub past: Vec<Classified>,
}

impl Partition {
    pub fn bucket(&self, bucket: Bucket) -> &[Classified] {
        match bucket {
            Bucket::Upcoming => &self.upcoming,
            Bucket::Past => &self.past,
        }
    }

    /// First page of a bucket. Classification is not redone when the page grows.
    pub fn page(&self, bucket: Bucket, page_size: usize) -> Page<'_> {
        Page::new(self.bucket(bucket), page_size)
    }

    pub fn len(&self) -> usize {
        self.upcoming.len() + self.past.len()
    }

    pub fn is_empty(&self) -> bool {
        self.upcoming.is_empty() && self.past.is_empty()
    }
}

/// Split appointments into upcoming and past using [`effective_status`].
///
/// Only claimed rows belong to a user; an OPEN row has no bucket and is dropped.
pub fn partition(appointments: impl IntoIterator<Item = Appointment>, now: Ms) -> Partition {
    let mut upcoming = Vec::new();
    let mut past = Vec::new();

    for appointment in appointments {
        let effective = effective_status(appointment.status, appointment.appointment_date, now);
        let classified = Classified { appointment, effective };
        if effective.is_upcoming() {
            upcoming.push(classified);
        } else if effective.is_past() {
            past.push(classified);
        } else {
            tracing::warn!(
                "partition: dropping unclaimed appointment {}",
                classified.appointment.id
            );
        }
    }

    upcoming.sort_by_key(|c| (c.appointment.appointment_date, c.appointment.id));
    past.sort_by_key(|c| (Reverse(c.appointment.appointment_date), c.appointment.id));

    Partition { now, upcoming, past }
}

/// A growing window over one bucket ("show more").
#[derive(Debug, Clone, Copy)]
pub struct Page<'a> {
    rows: &'a [Classified],
    shown: usize,
    page_size: usize,
}

impl<'a> Page<'a> {
    pub fn new(rows: &'a [Classified], page_size: usize) -> Self {
        let page_size = page_size.max(1);
        Self {
            rows,
            shown: page_size.min(rows.len()),
            page_size,
        }
    }

    pub fn visible(&self) -> &'a [Classified] {
        &self.rows[..self.shown]
    }

    pub fn has_more(&self) -> bool {
        self.shown < self.rows.len()
    }

    pub fn total(&self) -> usize {
        self.rows.len()
    }

    /// Reveal up to one more page. Returns the newly revealed rows.
    pub fn show_more(&mut self) -> &'a [Classified] {
        let prev = self.shown;
        self.shown = (self.shown + self.page_size).min(self.rows.len());
        &self.rows[prev..self.shown]
    }
}
