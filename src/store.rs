use chrono::NaiveDate;
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use thiserror::Error;
use uuid::Uuid;

use crate::engine::fare::round2;
use crate::geo::haversine_km;
use crate::models::driver::{Driver, GeoPoint};
use crate::models::job::Job;
use crate::models::ledger::{LedgerEntry, RiderStats};
use crate::models::payment::Payment;
use crate::models::rates::{Category, Service};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),
}

#[derive(Default)]
pub struct Store {
    jobs: DashMap<Uuid, Job>,
    drivers: DashMap<Uuid, Driver>,
    services: DashMap<Uuid, Service>,
    categories: DashMap<Uuid, Category>,
    /// At most one payment per job; the key doubles as the settlement guard.
    payments: DashMap<Uuid, Payment>,
    ledger: DashMap<(Uuid, NaiveDate), LedgerEntry>,
    riders: DashMap<Uuid, RiderStats>,
    platform_revenue: DashMap<NaiveDate, f64>,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_job(&self, job: Job) {
        self.jobs.insert(job.id, job);
    }

    pub fn get_job(&self, id: Uuid) -> Result<Job, StoreError> {
        self.jobs
            .get(&id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| StoreError::NotFound(format!("job {id} not found")))
    }

    /// Applies `apply` only if `guard` still holds for the stored job.
    ///
    /// A failed guard is a `Conflict`: somebody else changed the job between
    /// the caller's read and this write.
    pub fn update_job_if<G, F>(&self, id: Uuid, guard: G, apply: F) -> Result<Job, StoreError>
    where
        G: FnOnce(&Job) -> bool,
        F: FnOnce(&mut Job),
    {
        let mut job = self
            .jobs
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("job {id} not found")))?;

        if !guard(job.value()) {
            return Err(StoreError::Conflict(format!(
                "job {id} was modified concurrently"
            )));
        }

        apply(job.value_mut());
        job.updated_at = Utc::now();
        Ok(job.clone())
    }

    pub fn job_count(&self) -> usize {
        self.jobs.len()
    }

    pub fn insert_driver(&self, driver: Driver) -> Result<(), StoreError> {
        match self.drivers.entry(driver.id) {
            Entry::Occupied(_) => Err(StoreError::Conflict(format!(
                "driver {} already registered",
                driver.id
            ))),
            Entry::Vacant(slot) => {
                slot.insert(driver);
                Ok(())
            }
        }
    }

    pub fn get_driver(&self, id: Uuid) -> Result<Driver, StoreError> {
        self.drivers
            .get(&id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| StoreError::NotFound(format!("driver {id} not found")))
    }

    pub fn list_drivers(&self) -> Vec<Driver> {
        self.drivers
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn update_driver<F>(&self, id: Uuid, apply: F) -> Result<Driver, StoreError>
    where
        F: FnOnce(&mut Driver),
    {
        let mut driver = self
            .drivers
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("driver {id} not found")))?;

        apply(driver.value_mut());
        driver.updated_at = Utc::now();
        Ok(driver.clone())
    }

    /// Online drivers within `radius_meters` of `point`, nearest first.
    /// Drivers still reporting `[0,0]` are skipped.
    pub fn online_drivers_within(&self, point: &GeoPoint, radius_meters: f64) -> Vec<(f64, Driver)> {
        let mut nearby: Vec<(f64, Driver)> = self
            .drivers
            .iter()
            .filter_map(|entry| {
                let driver = entry.value();
                if !driver.is_online || driver.location.is_degenerate() {
                    return None;
                }

                let distance_meters = haversine_km(point, &driver.location) * 1_000.0;
                (distance_meters <= radius_meters).then(|| (distance_meters, driver.clone()))
            })
            .collect();

        nearby.sort_by(|a, b| a.0.total_cmp(&b.0));
        nearby
    }

    /// Adds one settled job worth `driver_share` to the driver's lifetime counters.
    pub fn credit_driver(&self, id: Uuid, driver_share: f64) -> Result<Driver, StoreError> {
        self.update_driver(id, |driver| {
            driver.total_earning = round2(driver.total_earning + driver_share);
            driver.completed_jobs += 1;
        })
    }

    pub fn driver_count(&self) -> usize {
        self.drivers.len()
    }

    pub fn insert_service(&self, service: Service) {
        self.services.insert(service.id, service);
    }

    pub fn get_service(&self, id: Uuid) -> Result<Service, StoreError> {
        self.services
            .get(&id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| StoreError::NotFound(format!("service {id} not found")))
    }

    pub fn list_services(&self) -> Vec<Service> {
        self.services
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn insert_category(&self, category: Category) {
        self.categories.insert(category.id, category);
    }

    pub fn get_category(&self, id: Uuid) -> Result<Category, StoreError> {
        self.categories
            .get(&id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| StoreError::NotFound(format!("category {id} not found")))
    }

    pub fn list_categories(&self) -> Vec<Category> {
        self.categories
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn payment_for_job(&self, job_id: Uuid) -> Option<Payment> {
        self.payments.get(&job_id).map(|entry| entry.value().clone())
    }

    /// Insert-if-absent keyed on the job id.
    pub fn insert_payment_if_absent(&self, payment: Payment) -> Result<Payment, StoreError> {
        match self.payments.entry(payment.job_id) {
            Entry::Occupied(_) => Err(StoreError::Conflict(format!(
                "job {} already settled",
                payment.job_id
            ))),
            Entry::Vacant(slot) => Ok(slot.insert(payment).value().clone()),
        }
    }

    pub fn payment_count(&self) -> usize {
        self.payments.len()
    }

    /// Creates the day's entry on first use, then applies `apply` in place.
    pub fn upsert_ledger<F>(&self, driver_id: Uuid, date: NaiveDate, apply: F) -> LedgerEntry
    where
        F: FnOnce(&mut LedgerEntry),
    {
        let mut entry = self
            .ledger
            .entry((driver_id, date))
            .or_insert_with(|| LedgerEntry::new(driver_id, date));

        apply(entry.value_mut());
        entry.clone()
    }

    /// Runs `apply` against an existing entry; a missing day is `NotFound`.
    pub fn with_ledger_entry<T, F>(
        &self,
        driver_id: Uuid,
        date: NaiveDate,
        apply: F,
    ) -> Result<T, StoreError>
    where
        F: FnOnce(&mut LedgerEntry) -> T,
    {
        let mut entry = self.ledger.get_mut(&(driver_id, date)).ok_or_else(|| {
            StoreError::NotFound(format!("no ledger entry for driver {driver_id} on {date}"))
        })?;

        Ok(apply(entry.value_mut()))
    }

    pub fn ledger_entries(
        &self,
        driver_id: Uuid,
        from: Option<NaiveDate>,
        to: Option<NaiveDate>,
    ) -> Vec<LedgerEntry> {
        self.ledger
            .iter()
            .filter(|entry| {
                let (owner, date) = *entry.key();
                owner == driver_id
                    && from.is_none_or(|from| date >= from)
                    && to.is_none_or(|to| date <= to)
            })
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn record_trip(&self, rider_id: Uuid, fare: f64) -> RiderStats {
        let mut stats = self.riders.entry(rider_id).or_insert_with(|| RiderStats {
            rider_id,
            ..RiderStats::default()
        });

        stats.trip_count += 1;
        stats.total_spent = round2(stats.total_spent + fare);
        stats.clone()
    }

    pub fn rider_stats(&self, rider_id: Uuid) -> RiderStats {
        self.riders
            .get(&rider_id)
            .map(|entry| entry.value().clone())
            .unwrap_or(RiderStats {
                rider_id,
                ..RiderStats::default()
            })
    }

    pub fn add_platform_revenue(&self, date: NaiveDate, amount: f64) {
        let mut day = self.platform_revenue.entry(date).or_insert(0.0);
        *day = round2(*day + amount);
    }

    /// Per-day platform revenue, oldest first.
    pub fn platform_revenue(&self) -> Vec<(NaiveDate, f64)> {
        let mut days: Vec<(NaiveDate, f64)> = self
            .platform_revenue
            .iter()
            .map(|entry| (*entry.key(), *entry.value()))
            .collect();
        days.sort_by_key(|(date, _)| *date);
        days
    }
}
