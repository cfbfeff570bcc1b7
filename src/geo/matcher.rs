use crate::models::driver::{Driver, GeoPoint};
use crate::models::job::Job;
use crate::store::Store;

/// Online drivers around `point`, nearest first. An empty result is not an
/// error here; callers decide whether "nobody nearby" should fail.
pub fn find_online_drivers_near(store: &Store, point: &GeoPoint, radius_meters: f64) -> Vec<Driver> {
    store
        .online_drivers_within(point, radius_meters)
        .into_iter()
        .map(|(_, driver)| driver)
        .collect()
}

/// Drivers who may still be offered `job`: nearby, online, and not among
/// those who already declined it.
pub fn candidates_for(store: &Store, job: &Job, radius_meters: f64) -> Vec<Driver> {
    find_online_drivers_near(store, &job.pickup, radius_meters)
        .into_iter()
        .filter(|driver| !job.rejected_driver_ids.contains(&driver.id))
        .collect()
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use chrono::Utc;
    use uuid::Uuid;

    use super::{candidates_for, find_online_drivers_near};
    use crate::models::driver::{Driver, GeoPoint};
    use crate::models::job::{Job, JobKind, JobState};
    use crate::models::payment::{PaymentMethod, PaymentStatus};
    use crate::store::Store;

    fn driver(seed: u128, lat: f64, lng: f64) -> Driver {
        Driver {
            id: Uuid::from_u128(seed),
            name: "test-driver".to_string(),
            location: GeoPoint::new(lat, lng),
            is_online: true,
            total_earning: 0.0,
            completed_jobs: 0,
            updated_at: Utc::now(),
        }
    }

    fn job_at(lat: f64, lng: f64, rejected: &[u128]) -> Job {
        Job {
            id: Uuid::new_v4(),
            kind: JobKind::Ride,
            requester_id: Uuid::new_v4(),
            driver_id: None,
            pickup: GeoPoint::new(lat, lng),
            dropoff: GeoPoint::new(lat + 0.01, lng),
            service_id: None,
            category_id: None,
            distance_km: 1.1,
            duration_min: 2.2,
            fare: 70.0,
            state: JobState::Requested,
            otp: None,
            participants: Vec::new(),
            seats_available: 0,
            payment_method: PaymentMethod::Offline,
            payment_status: PaymentStatus::Pending,
            rejected_driver_ids: rejected.iter().map(|seed| Uuid::from_u128(*seed)).collect::<BTreeSet<_>>(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            accepted_at: None,
            started_at: None,
            completed_at: None,
            cancelled_at: None,
        }
    }

    #[test]
    fn empty_area_yields_empty_list() {
        let store = Store::new();
        store.insert_driver(driver(1, 19.07, 72.87)).unwrap();

        let found = find_online_drivers_near(&store, &GeoPoint::new(28.61, 77.20), 5_000.0);
        assert!(found.is_empty());
    }

    #[test]
    fn declined_drivers_are_not_offered_again() {
        let store = Store::new();
        store.insert_driver(driver(1, 19.0701, 72.8701)).unwrap();
        store.insert_driver(driver(2, 19.0702, 72.8702)).unwrap();

        let job = job_at(19.07, 72.87, &[1]);
        let offered: Vec<Uuid> = candidates_for(&store, &job, 5_000.0)
            .iter()
            .map(|driver| driver.id)
            .collect();

        assert_eq!(offered, vec![Uuid::from_u128(2)]);
    }
}
