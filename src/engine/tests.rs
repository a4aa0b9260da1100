use std::collections::BTreeMap;

use async_trait::async_trait;

use super::*;
use crate::clock::ManualClock;
use crate::collaborators::*;
use crate::limits::*;

const OWNER: &str = "alice";
const GUEST: &str = "bob";
const CHARITY: &str = "charity";

struct Harness {
    engine: Engine,
    path: PathBuf,
    clock: Arc<ManualClock>,
    issuer: Arc<SequentialIssuer>,
    ledger: Arc<InMemoryLedger>,
}

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("stayledger_test_engine");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

fn config() -> ProtocolConfig {
    ProtocolConfig::new(CHARITY.into(), 500, 0).unwrap()
}

fn harness(name: &str) -> Harness {
    let path = test_wal_path(name);
    let clock = Arc::new(ManualClock::new(0));
    let issuer = Arc::new(SequentialIssuer::new());
    let ledger = Arc::new(InMemoryLedger::new());
    let collaborators = Collaborators::new(issuer.clone(), ledger.clone(), clock.clone());
    let engine = Engine::new(path.clone(), Arc::new(NotifyHub::new()), config(), collaborators).unwrap();
    Harness {
        engine,
        path,
        clock,
        issuer,
        ledger,
    }
}

impl Harness {
    /// Fresh engine over the same WAL and collaborators.
    fn restart(&self) -> Engine {
        let collaborators = Collaborators::new(self.issuer.clone(), self.ledger.clone(), self.clock.clone());
        Engine::new(self.path.clone(), Arc::new(NotifyHub::new()), config(), collaborators).unwrap()
    }

    async fn facility(&self, uri: &str) -> Ulid {
        self.engine
            .register_facility(&OWNER.into(), uri.into(), true)
            .await
            .unwrap()
    }

    async fn space(&self, capacity: u32, price: Wei) -> (Ulid, Ulid) {
        let facility_id = self.facility(&format!("ipfs://facility/{}", Ulid::new())).await;
        let space_id = self
            .engine
            .add_space(&OWNER.into(), facility_id, capacity, price, true, "ipfs://space".into())
            .await
            .unwrap();
        (facility_id, space_id)
    }

    async fn book(&self, space_id: Ulid, day_start: Day, days: u32, units: u32, payment: Wei) -> Result<Stay, EngineError> {
        self.engine
            .book_stay(&GUEST.into(), space_id, day_start, days, units, payment, String::new())
            .await
    }
}

/// Every day's calendar count equals the units of the stays covering it,
/// and never exceeds capacity.
async fn assert_ledger_consistent(engine: &Engine) {
    let _dir = engine.directory.read().await;
    for entry in engine.spaces.iter() {
        let ss = entry.value().read().await;
        let mut expected: BTreeMap<Day, u32> = BTreeMap::new();
        for stay in ss.stays.values().filter(|s| s.status.holds_capacity()) {
            for day in stay.range.iter() {
                *expected.entry(day).or_default() += stay.units;
            }
        }
        for (day, units) in &expected {
            assert_eq!(ss.calendar.booked_on(*day), *units, "space {} day {day}", ss.space.id);
            assert!(*units <= ss.space.capacity, "oversold day {day}");
        }
        assert_eq!(ss.calendar.len(), expected.len(), "stray calendar entries");
    }
}

struct RejectingRail;

#[async_trait]
impl PaymentRail for RejectingRail {
    async fn pay(&self, _payout: &Payout) -> Result<(), CollaboratorError> {
        Err(CollaboratorError::Rejected("rail offline".into()))
    }
}

struct RejectingIssuer;

#[async_trait]
impl TokenIssuer for RejectingIssuer {
    async fn mint(&self, _owner: &Account, _stay_id: Ulid) -> Result<TokenId, CollaboratorError> {
        Err(CollaboratorError::Unavailable("issuer offline".into()))
    }

    async fn burn(&self, _token_id: TokenId) -> Result<(), CollaboratorError> {
        Ok(())
    }
}

// ── Directory ─────────────────────────────────────────────

#[tokio::test]
async fn register_and_list_facilities() {
    let h = harness("register_list.wal");
    let a = h.facility("ipfs://a").await;
    let b = h.facility("ipfs://b").await;
    let c = h
        .engine
        .register_facility(&"carol".into(), "ipfs://a".into(), false)
        .await
        .unwrap();

    assert_eq!(h.engine.facility_ids().await, vec![a, b, c]);
    assert_eq!(h.engine.facility_ids_of(&OWNER.into()).await, vec![a, b]);
    assert_eq!(h.engine.facility_ids_of(&"nobody".into()).await, Vec::<Ulid>::new());

    let fetched = h.engine.facility(&c).await.unwrap();
    assert_eq!(fetched.owner, Account::from("carol"));
    assert_eq!(fetched.data_uri, "ipfs://a");
    assert!(!fetched.active);
    assert!(fetched.exists());
}

#[tokio::test]
async fn empty_uri_rejected() {
    let h = harness("empty_uri.wal");
    let result = h.engine.register_facility(&OWNER.into(), String::new(), true).await;
    assert!(matches!(result, Err(EngineError::EmptyUri)));
    assert!(h.engine.facility_ids().await.is_empty());
}

#[tokio::test]
async fn duplicate_facility_rejected() {
    let h = harness("duplicate_facility.wal");
    h.facility("ipfs://same").await;
    let result = h.engine.register_facility(&OWNER.into(), "ipfs://same".into(), false).await;
    assert!(matches!(result, Err(EngineError::DuplicateFacility { .. })));
    assert_eq!(h.engine.facility_ids().await.len(), 1);
}

#[tokio::test]
async fn deleted_facility_frees_its_uri() {
    let h = harness("delete_frees_uri.wal");
    let first = h.facility("ipfs://same").await;
    h.engine.delete_facility(&OWNER.into(), first).await.unwrap();
    let second = h.facility("ipfs://same").await;
    assert_ne!(first, second);
    assert_eq!(h.engine.facility_ids().await, vec![second]);
    assert!(!h.engine.facility(&first).await.unwrap().exists());
}

#[tokio::test]
async fn update_facility_checks_owner_and_uri() {
    let h = harness("update_facility.wal");
    let a = h.facility("ipfs://a").await;
    h.facility("ipfs://b").await;

    let result = h.engine.update_facility(&"mallory".into(), a, "ipfs://x".into(), true).await;
    assert!(matches!(result, Err(EngineError::NotFacilityOwner(_))));
    let result = h.engine.update_facility(&OWNER.into(), a, "ipfs://b".into(), true).await;
    assert!(matches!(result, Err(EngineError::DuplicateFacility { .. })));
    let result = h.engine.update_facility(&OWNER.into(), a, String::new(), true).await;
    assert!(matches!(result, Err(EngineError::EmptyUri)));

    h.engine.update_facility(&OWNER.into(), a, "ipfs://a2".into(), false).await.unwrap();
    let fetched = h.engine.facility(&a).await.unwrap();
    assert_eq!(fetched.data_uri, "ipfs://a2");
    assert!(!fetched.active);
    // The old URI is free again.
    h.facility("ipfs://a").await;
}

#[tokio::test]
async fn add_space_requires_owner() {
    let h = harness("add_space_owner.wal");
    let facility_id = h.facility("ipfs://f").await;
    let result = h
        .engine
        .add_space(&"mallory".into(), facility_id, 1, 10, true, String::new())
        .await;
    assert!(matches!(result, Err(EngineError::NotFacilityOwner(id)) if id == facility_id));

    let missing = Ulid::new();
    let result = h.engine.add_space(&OWNER.into(), missing, 1, 10, true, String::new()).await;
    assert!(matches!(result, Err(EngineError::FacilityNotFound(id)) if id == missing));

    let result = h.engine.add_space(&OWNER.into(), facility_id, 0, 10, true, String::new()).await;
    assert!(matches!(result, Err(EngineError::InvalidArgument(_))));
}

#[tokio::test]
async fn spaces_listed_in_creation_order() {
    let h = harness("space_order.wal");
    let facility_id = h.facility("ipfs://f").await;
    let owner = Account::from(OWNER);
    let s1 = h.engine.add_space(&owner, facility_id, 1, 10, true, "1".into()).await.unwrap();
    let s2 = h.engine.add_space(&owner, facility_id, 2, 20, false, "2".into()).await.unwrap();
    let s3 = h.engine.add_space(&owner, facility_id, 3, 30, true, "3".into()).await.unwrap();

    assert_eq!(h.engine.space_ids_of(&facility_id).await.unwrap(), vec![s1, s2, s3]);
    assert_eq!(h.engine.active_space_ids_of(&facility_id).await.unwrap(), vec![s1, s3]);

    h.engine.delete_space(&owner, s1).await.unwrap();
    assert_eq!(h.engine.space_ids_of(&facility_id).await.unwrap(), vec![s2, s3]);
    assert!(!h.engine.space(&s1).await.unwrap().exists());

    let space = h.engine.space(&s2).await.unwrap();
    assert_eq!((space.capacity, space.price_per_night, space.facility_id), (2, 20, facility_id));
}

// ── Availability ──────────────────────────────────────────

#[tokio::test]
async fn booking_sequence_reduces_availability() {
    let h = harness("booking_sequence.wal");
    let (_, space_id) = h.space(10, 1).await;

    let steps: [(Day, u32, u32, [u32; 5]); 5] = [
        (100, 1, 5, [10, 5, 10, 10, 10]),
        (101, 2, 3, [10, 5, 7, 7, 10]),
        (102, 1, 1, [10, 5, 7, 6, 10]),
        (99, 2, 2, [8, 3, 7, 6, 10]),
        (99, 5, 3, [5, 0, 4, 3, 7]),
    ];
    for (day_start, days, units, expected) in steps {
        h.book(space_id, day_start, days, units, Wei::from(days * units)).await.unwrap();
        assert_eq!(h.engine.availability(&space_id, 99, 5).await.unwrap(), expected.to_vec());
    }
    assert_ledger_consistent(&h.engine).await;
}

#[tokio::test]
async fn failed_booking_changes_no_day() {
    let h = harness("atomic_rejection.wal");
    let (_, space_id) = h.space(4, 1).await;
    h.book(space_id, 12, 1, 3, 3).await.unwrap();
    let before = h.engine.availability(&space_id, 10, 3).await.unwrap();

    // Days 10 and 11 have room; day 12 does not.
    let result = h.book(space_id, 10, 3, 2, 6).await;
    assert!(matches!(
        result,
        Err(EngineError::CapacityExceeded { day: 12, capacity: 4, .. })
    ));
    assert_eq!(h.engine.availability(&space_id, 10, 3).await.unwrap(), before);
    assert_eq!(h.engine.stays_of_space(&space_id).await.unwrap().len(), 1);
    assert_eq!(h.issuer.minted(), 1);
}

#[tokio::test]
async fn repeated_availability_reads_identical() {
    let h = harness("idempotent_read.wal");
    let (_, space_id) = h.space(3, 0).await;
    h.book(space_id, 5, 3, 2, 0).await.unwrap();
    let first = h.engine.availability(&space_id, 0, 10).await.unwrap();
    let second = h.engine.availability(&space_id, 0, 10).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(first, vec![3, 3, 3, 3, 3, 1, 1, 1, 3, 3]);
}

#[tokio::test]
async fn availability_query_bounds() {
    let h = harness("availability_bounds.wal");
    let (_, space_id) = h.space(3, 0).await;
    assert!(matches!(
        h.engine.availability(&space_id, 0, 0).await,
        Err(EngineError::InvalidArgument(_))
    ));
    assert!(matches!(
        h.engine.availability(&space_id, 0, MAX_QUERY_DAYS + 1).await,
        Err(EngineError::LimitExceeded(_))
    ));
    let missing = Ulid::new();
    assert!(matches!(
        h.engine.availability(&missing, 0, 1).await,
        Err(EngineError::SpaceNotFound(_))
    ));
    // Far-future days cost nothing to query.
    assert_eq!(h.engine.availability(&space_id, 1_000_000_000, 2).await.unwrap(), vec![3, 3]);
}

// ── Booking ───────────────────────────────────────────────

#[tokio::test]
async fn payment_must_cover_price() {
    let h = harness("insufficient_payment.wal");
    let (_, space_id) = h.space(5, 12_345).await;

    let result = h.book(space_id, 0, 1, 1, 12_344).await;
    assert!(matches!(
        result,
        Err(EngineError::InsufficientPayment { required: 12_345, offered: 12_344 })
    ));
    assert_eq!(h.engine.availability(&space_id, 0, 1).await.unwrap(), vec![5]);

    let stay = h.book(space_id, 0, 1, 1, 12_345).await.unwrap();
    assert_eq!(stay.amount_paid, 12_345);
    assert_eq!(stay.escrow, 12_345);

    let result = h.book(space_id, 0, 2, 3, 12_345 * 6 - 1).await;
    assert!(matches!(result, Err(EngineError::InsufficientPayment { required, .. }) if required == 74_070));
}

#[tokio::test]
async fn overpayment_is_held_in_full() {
    let h = harness("overpayment.wal");
    let (_, space_id) = h.space(5, 100).await;
    let stay = h.book(space_id, 0, 1, 1, 150).await.unwrap();
    assert_eq!(stay.amount_paid, 150);
    assert_eq!(stay.escrow, 150);
}

#[tokio::test]
async fn grace_day_in_the_past() {
    let h = harness("grace_day.wal");
    let (_, space_id) = h.space(5, 0).await;
    h.clock.set(50 * SECONDS_PER_DAY + 3_600);
    assert_eq!(h.engine.today(), 50);

    h.book(space_id, 49, 1, 1, 0).await.unwrap();
    let result = h.book(space_id, 48, 1, 1, 0).await;
    assert!(matches!(result, Err(EngineError::PastDate { day_start: 48, today: 50 })));
}

#[tokio::test]
async fn booking_rejects_bad_shapes() {
    let h = harness("bad_shapes.wal");
    let (_, space_id) = h.space(5, 0).await;
    assert!(matches!(h.book(space_id, 0, 0, 1, 0).await, Err(EngineError::InvalidArgument(_))));
    assert!(matches!(h.book(space_id, 0, 1, 0, 0).await, Err(EngineError::InvalidArgument(_))));
    assert!(matches!(
        h.book(space_id, 0, MAX_STAY_DAYS + 1, 1, 0).await,
        Err(EngineError::LimitExceeded(_))
    ));
    assert!(matches!(
        h.book(Ulid::new(), 0, 1, 1, 0).await,
        Err(EngineError::SpaceNotFound(_))
    ));
    assert!(matches!(h.book(space_id, 0, 1, 6, 0).await, Err(EngineError::CapacityExceeded { .. })));
}

#[tokio::test]
async fn price_overflow_rejected() {
    let h = harness("price_overflow.wal");
    let (_, space_id) = h.space(5, u128::MAX / 2).await;
    let result = h.book(space_id, 0, 3, 1, u128::MAX).await;
    assert!(matches!(result, Err(EngineError::LimitExceeded("payment overflow"))));
}

#[tokio::test]
async fn stay_past_the_last_day_rejected() {
    let h = harness("day_overflow.wal");
    let (_, space_id) = h.space(1, 1).await;

    for _ in 0..5 {
        let result = h.book(space_id, Day::MAX - 1, 5, 1, 5).await;
        assert!(matches!(result, Err(EngineError::InvalidArgument(_))));
    }

    // The last representable nights are still bookable, exactly once.
    h.book(space_id, Day::MAX - 2, 2, 1, 2).await.unwrap();
    assert!(matches!(
        h.book(space_id, Day::MAX - 2, 2, 1, 2).await,
        Err(EngineError::CapacityExceeded { .. })
    ));

    let stay = h.book(space_id, 10, 1, 1, 1).await.unwrap();
    let moved = h
        .engine
        .modify_stay(&GUEST.into(), stay.id, Day::MAX - 1, 3, 1, 10)
        .await;
    assert!(matches!(moved, Err(EngineError::InvalidArgument(_))));
    assert_eq!(h.engine.availability(&space_id, 10, 1).await.unwrap(), vec![0]);
    assert_ledger_consistent(&h.engine).await;
}

#[tokio::test]
async fn availability_past_the_last_day_rejected() {
    let h = harness("availability_overflow.wal");
    let (_, space_id) = h.space(3, 1).await;

    let result = h.engine.availability(&space_id, Day::MAX, 2).await;
    assert!(matches!(result, Err(EngineError::InvalidArgument(_))));
    assert_eq!(h.engine.availability(&space_id, Day::MAX - 1, 1).await.unwrap(), vec![3]);
}

#[tokio::test]
async fn inactive_facility_or_space_not_bookable() {
    let h = harness("inactive.wal");
    let (facility_id, space_id) = h.space(5, 0).await;
    let owner = Account::from(OWNER);

    h.engine
        .update_space(&owner, space_id, 5, 0, false, "ipfs://space".into())
        .await
        .unwrap();
    assert!(matches!(h.book(space_id, 0, 1, 1, 0).await, Err(EngineError::Inactive(id)) if id == space_id));

    h.engine
        .update_space(&owner, space_id, 5, 0, true, "ipfs://space".into())
        .await
        .unwrap();
    let uri = h.engine.facility(&facility_id).await.unwrap().data_uri;
    h.engine.update_facility(&owner, facility_id, uri, false).await.unwrap();
    assert!(matches!(h.book(space_id, 0, 1, 1, 0).await, Err(EngineError::Inactive(id)) if id == facility_id));
}

#[tokio::test]
async fn booking_mints_a_token_for_the_guest() {
    let h = harness("mint.wal");
    let (_, space_id) = h.space(5, 7).await;
    let stay = h
        .engine
        .book_stay(&GUEST.into(), space_id, 3, 2, 1, 14, "ipfs://stay".into())
        .await
        .unwrap();
    assert_eq!(stay.token_id, 1);
    assert_eq!(stay.status, StayStatus::Booked);
    assert_eq!(stay.guest, Account::from(GUEST));
    assert_eq!(stay.data_uri, "ipfs://stay");
    assert_eq!(h.issuer.owner_of(stay.token_id), Some(Account::from(GUEST)));
    assert_eq!(h.issuer.stay_of(stay.token_id), Some(stay.id));
    assert_eq!(h.engine.stay(&stay.id).await.unwrap(), stay);
}

#[tokio::test]
async fn mint_failure_aborts_booking() {
    let path = test_wal_path("mint_failure.wal");
    let clock = Arc::new(ManualClock::new(0));
    let collaborators = Collaborators::new(Arc::new(RejectingIssuer), Arc::new(InMemoryLedger::new()), clock);
    let engine = Engine::new(path, Arc::new(NotifyHub::new()), config(), collaborators).unwrap();
    let owner = Account::from(OWNER);
    let facility_id = engine.register_facility(&owner, "ipfs://f".into(), true).await.unwrap();
    let space_id = engine.add_space(&owner, facility_id, 2, 0, true, String::new()).await.unwrap();

    let result = engine.book_stay(&GUEST.into(), space_id, 0, 1, 1, 0, String::new()).await;
    assert!(matches!(result, Err(EngineError::MintFailure(_))));
    assert_eq!(engine.availability(&space_id, 0, 1).await.unwrap(), vec![2]);
    assert!(engine.stays_of_guest(&GUEST.into()).await.is_empty());
}

#[tokio::test]
async fn concurrent_bookings_never_oversell() {
    let h = harness("concurrent.wal");
    let (_, space_id) = h.space(5, 0).await;
    let engine = Arc::new(h.engine);

    let mut handles = Vec::new();
    for i in 0..20 {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            let guest = Account::new(format!("guest-{i}"));
            engine.book_stay(&guest, space_id, 10, 2, 1, 0, String::new()).await
        }));
    }
    let mut booked = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => booked += 1,
            Err(EngineError::CapacityExceeded { .. }) => {}
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(booked, 5);
    assert_eq!(engine.availability(&space_id, 10, 2).await.unwrap(), vec![0, 0]);
    assert_ledger_consistent(&engine).await;
}

// ── Modification ──────────────────────────────────────────

#[tokio::test]
async fn modify_moves_the_reservation() {
    let h = harness("modify_moves.wal");
    let (_, space_id) = h.space(3, 10).await;
    let stay = h.book(space_id, 5, 2, 1, 20).await.unwrap();

    let modified = h
        .engine
        .modify_stay(&GUEST.into(), stay.id, 6, 3, 2, 40)
        .await
        .unwrap();
    assert_eq!(modified.range, DayRange::new(6, 3).unwrap());
    assert_eq!(modified.units, 2);
    assert_eq!(modified.amount_paid, 60);
    assert_eq!(modified.escrow, 60);
    assert_eq!(modified.status, StayStatus::Booked);
    assert_eq!(h.engine.availability(&space_id, 5, 5).await.unwrap(), vec![3, 1, 1, 1, 3]);
    assert_ledger_consistent(&h.engine).await;
}

#[tokio::test]
async fn failed_modification_keeps_original() {
    let h = harness("modify_atomic.wal");
    let (_, space_id) = h.space(2, 0).await;
    let stay = h.book(space_id, 0, 2, 1, 0).await.unwrap();
    h.engine
        .book_stay(&"carol".into(), space_id, 3, 1, 2, 0, String::new())
        .await
        .unwrap();
    let before = h.engine.availability(&space_id, 0, 4).await.unwrap();
    assert_eq!(before, vec![1, 1, 2, 0]);

    // Day 3 is full, so moving to [2, 4) fails and nothing moves.
    let result = h.engine.modify_stay(&GUEST.into(), stay.id, 2, 2, 1, 0).await;
    assert!(matches!(result, Err(EngineError::CapacityExceeded { day: 3, .. })));
    assert_eq!(h.engine.availability(&space_id, 0, 4).await.unwrap(), before);
    assert_eq!(h.engine.stay(&stay.id).await.unwrap(), stay);
    assert_ledger_consistent(&h.engine).await;
}

#[tokio::test]
async fn modify_can_grow_into_its_own_units() {
    let h = harness("modify_net.wal");
    let (_, space_id) = h.space(2, 0).await;
    let stay = h.book(space_id, 0, 2, 2, 0).await.unwrap();
    // Shifting by one day overlaps day 1, which only fits because the old
    // reservation is released in the same step.
    h.engine.modify_stay(&GUEST.into(), stay.id, 1, 2, 2, 0).await.unwrap();
    assert_eq!(h.engine.availability(&space_id, 0, 3).await.unwrap(), vec![2, 0, 0]);
}

#[tokio::test]
async fn modify_requires_payment_for_growth() {
    let h = harness("modify_payment.wal");
    let (_, space_id) = h.space(5, 100).await;
    let stay = h.book(space_id, 0, 2, 1, 200).await.unwrap();

    let result = h.engine.modify_stay(&GUEST.into(), stay.id, 0, 3, 1, 99).await;
    assert!(matches!(
        result,
        Err(EngineError::InsufficientPayment { required: 300, offered: 299 })
    ));
    assert_eq!(h.engine.stay(&stay.id).await.unwrap(), stay);

    let grown = h.engine.modify_stay(&GUEST.into(), stay.id, 0, 3, 1, 100).await.unwrap();
    assert_eq!(grown.amount_paid, 300);
}

#[tokio::test]
async fn shrinking_does_not_refund() {
    let h = harness("modify_shrink.wal");
    let (_, space_id) = h.space(5, 100).await;
    let stay = h.book(space_id, 0, 3, 1, 300).await.unwrap();
    let shrunk = h.engine.modify_stay(&GUEST.into(), stay.id, 0, 1, 1, 0).await.unwrap();
    assert_eq!(shrunk.amount_paid, 300);
    assert_eq!(shrunk.escrow, 300);
    assert_eq!(h.ledger.balance_of(&GUEST.into()), 0);
    assert_eq!(h.engine.availability(&space_id, 0, 3).await.unwrap(), vec![4, 5, 5]);
}

#[tokio::test]
async fn modify_uses_current_price() {
    let h = harness("modify_price.wal");
    let (_, space_id) = h.space(5, 100).await;
    let stay = h.book(space_id, 0, 1, 1, 100).await.unwrap();
    h.engine
        .update_space(&OWNER.into(), space_id, 5, 150, true, "ipfs://space".into())
        .await
        .unwrap();

    let result = h.engine.modify_stay(&GUEST.into(), stay.id, 1, 1, 1, 0).await;
    assert!(matches!(result, Err(EngineError::InsufficientPayment { required: 150, .. })));
    let moved = h.engine.modify_stay(&GUEST.into(), stay.id, 1, 1, 1, 50).await.unwrap();
    assert_eq!(moved.price_per_night, 150);
}

#[tokio::test]
async fn only_guest_may_modify_or_cancel() {
    let h = harness("guest_only.wal");
    let (_, space_id) = h.space(5, 0).await;
    let stay = h.book(space_id, 0, 1, 1, 0).await.unwrap();
    let mallory = Account::from("mallory");

    let result = h.engine.modify_stay(&mallory, stay.id, 0, 1, 1, 0).await;
    assert!(matches!(result, Err(EngineError::Unauthorized(id)) if id == stay.id));
    let result = h.engine.cancel_stay(&mallory, stay.id).await;
    assert!(matches!(result, Err(EngineError::Unauthorized(_))));
    // The facility owner is not the guest either.
    let result = h.engine.cancel_stay(&OWNER.into(), stay.id).await;
    assert!(matches!(result, Err(EngineError::Unauthorized(_))));

    let missing = Ulid::new();
    let result = h.engine.cancel_stay(&GUEST.into(), missing).await;
    assert!(matches!(result, Err(EngineError::StayNotFound(id)) if id == missing));
}

// ── Payouts and lifecycle ─────────────────────────────────

#[tokio::test]
async fn cancel_pays_owner_and_charity() {
    let h = harness("cancel_payout.wal");
    let (_, space_id) = h.space(5, 12_345).await;
    let stay = h.book(space_id, 0, 1, 2, 24_690).await.unwrap();

    let payout = h.engine.cancel_stay(&GUEST.into(), stay.id).await.unwrap();
    assert_eq!(payout.charity_amount, 1_234); // floor(24_690 * 5%)
    assert_eq!(payout.owner_amount, 23_456);
    assert_eq!(h.ledger.balance_of(&OWNER.into()), 23_456);
    assert_eq!(h.ledger.balance_of(&CHARITY.into()), 1_234);

    let cancelled = h.engine.stay(&stay.id).await.unwrap();
    assert_eq!(cancelled.status, StayStatus::Cancelled);
    assert_eq!(cancelled.escrow, 0);
    assert_eq!(h.engine.availability(&space_id, 0, 1).await.unwrap(), vec![5]);

    let again = h.engine.cancel_stay(&GUEST.into(), stay.id).await;
    assert!(matches!(
        again,
        Err(EngineError::InvalidTransition { status: StayStatus::Cancelled, action: "cancel", .. })
    ));
    assert_ledger_consistent(&h.engine).await;
}

#[tokio::test]
async fn check_in_and_out_release_escrow() {
    let h = harness("lifecycle.wal");
    let (_, space_id) = h.space(5, 1_000).await;
    let owner = Account::from(OWNER);
    let stay = h.book(space_id, 2, 3, 2, 6_500).await.unwrap();

    let result = h.engine.check_in(&owner, stay.id).await;
    assert!(matches!(result, Err(EngineError::CheckInTooEarly { day_start: 2, today: 0 })));

    h.clock.advance_days(2);
    let result = h.engine.check_in(&GUEST.into(), stay.id).await;
    assert!(matches!(result, Err(EngineError::NotFacilityOwner(_))));

    let first = h.engine.check_in(&owner, stay.id).await.unwrap();
    assert_eq!(first.total(), 2_000);
    assert_eq!(first.charity_amount, 100);
    let checked_in = h.engine.stay(&stay.id).await.unwrap();
    assert_eq!(checked_in.status, StayStatus::CheckedIn);
    assert_eq!(checked_in.escrow, 4_500);

    let result = h.engine.cancel_stay(&GUEST.into(), stay.id).await;
    assert!(matches!(result, Err(EngineError::InvalidTransition { action: "cancel", .. })));
    let result = h.engine.modify_stay(&GUEST.into(), stay.id, 2, 1, 1, 0).await;
    assert!(matches!(result, Err(EngineError::InvalidTransition { action: "modify", .. })));

    let rest = h.engine.check_out(&owner, stay.id).await.unwrap();
    assert_eq!(rest.total(), 4_500);
    assert_eq!(rest.charity_amount, 225);
    let checked_out = h.engine.stay(&stay.id).await.unwrap();
    assert_eq!(checked_out.status, StayStatus::CheckedOut);
    assert_eq!(checked_out.escrow, 0);

    assert_eq!(h.ledger.balance_of(&owner), 1_900 + 4_275);
    assert_eq!(h.ledger.balance_of(&CHARITY.into()), 100 + 225);
    // Check-out leaves the occupied days booked.
    assert_eq!(h.engine.availability(&space_id, 2, 3).await.unwrap(), vec![3, 3, 3]);
    assert_ledger_consistent(&h.engine).await;

    let result = h.engine.check_out(&owner, stay.id).await;
    assert!(matches!(
        result,
        Err(EngineError::InvalidTransition { status: StayStatus::CheckedOut, .. })
    ));
}

#[tokio::test]
async fn check_out_requires_check_in() {
    let h = harness("checkout_requires_checkin.wal");
    let (_, space_id) = h.space(5, 10).await;
    let stay = h.book(space_id, 0, 1, 1, 10).await.unwrap();
    let result = h.engine.check_out(&OWNER.into(), stay.id).await;
    assert!(matches!(
        result,
        Err(EngineError::InvalidTransition { status: StayStatus::Booked, action: "check out", .. })
    ));
}

#[tokio::test]
async fn check_in_release_capped_by_escrow() {
    let h = harness("checkin_capped.wal");
    let (_, space_id) = h.space(5, 0).await;
    let stay = h.book(space_id, 0, 1, 1, 30).await.unwrap();
    // Price rises after booking; the stay keeps its snapshot.
    h.engine
        .update_space(&OWNER.into(), space_id, 5, 1_000, true, String::new())
        .await
        .unwrap();
    let payout = h.engine.check_in(&OWNER.into(), stay.id).await.unwrap();
    assert_eq!(payout.total(), 0);

    let result = h.engine.check_out(&OWNER.into(), stay.id).await.unwrap();
    assert_eq!(result.total(), 30);
}

#[tokio::test]
async fn payout_failure_commits_nothing() {
    let path = test_wal_path("payout_failure.wal");
    let clock = Arc::new(ManualClock::new(0));
    let collaborators = Collaborators::new(Arc::new(SequentialIssuer::new()), Arc::new(RejectingRail), clock);
    let engine = Engine::new(path, Arc::new(NotifyHub::new()), config(), collaborators).unwrap();
    let owner = Account::from(OWNER);
    let guest = Account::from(GUEST);
    let facility_id = engine.register_facility(&owner, "ipfs://f".into(), true).await.unwrap();
    let space_id = engine.add_space(&owner, facility_id, 2, 10, true, String::new()).await.unwrap();
    let stay = engine.book_stay(&guest, space_id, 0, 1, 1, 10, String::new()).await.unwrap();

    let result = engine.cancel_stay(&guest, stay.id).await;
    assert!(matches!(result, Err(EngineError::PayoutFailure(_))));
    assert_eq!(engine.stay(&stay.id).await.unwrap(), stay);
    assert_eq!(engine.availability(&space_id, 0, 1).await.unwrap(), vec![1]);

    let result = engine.check_in(&owner, stay.id).await;
    assert!(matches!(result, Err(EngineError::PayoutFailure(_))));
    assert_eq!(engine.stay(&stay.id).await.unwrap().status, StayStatus::Booked);
}

// ── Space updates and deletion ────────────────────────────

#[tokio::test]
async fn capacity_cannot_drop_below_bookings() {
    let h = harness("capacity_floor.wal");
    let (_, space_id) = h.space(5, 0).await;
    h.book(space_id, 7, 1, 3, 0).await.unwrap();
    let owner = Account::from(OWNER);

    let result = h.engine.update_space(&owner, space_id, 2, 0, true, String::new()).await;
    assert!(matches!(result, Err(EngineError::CapacityExceeded { day: 7, capacity: 2, .. })));
    h.engine.update_space(&owner, space_id, 3, 0, true, String::new()).await.unwrap();
    assert_eq!(h.engine.availability(&space_id, 7, 1).await.unwrap(), vec![0]);

    let result = h.engine.update_space(&"mallory".into(), space_id, 9, 0, true, String::new()).await;
    assert!(matches!(result, Err(EngineError::NotFacilityOwner(_))));
}

#[tokio::test]
async fn delete_blocked_by_pending_stays() {
    let h = harness("delete_pending.wal");
    let (facility_id, space_id) = h.space(5, 0).await;
    let owner = Account::from(OWNER);
    let stay = h.book(space_id, 0, 1, 1, 0).await.unwrap();

    let result = h.engine.delete_space(&owner, space_id).await;
    assert!(matches!(result, Err(EngineError::HasActiveStays(id)) if id == space_id));
    let result = h.engine.delete_facility(&owner, facility_id).await;
    assert!(matches!(result, Err(EngineError::HasActiveStays(id)) if id == facility_id));

    h.engine.cancel_stay(&GUEST.into(), stay.id).await.unwrap();
    h.engine.delete_facility(&owner, facility_id).await.unwrap();

    assert!(h.engine.facility_ids().await.is_empty());
    assert!(!h.engine.space(&space_id).await.unwrap().exists());
    assert!(matches!(h.book(space_id, 0, 1, 1, 0).await, Err(EngineError::SpaceNotFound(_))));
    assert!(matches!(
        h.engine.spaces_of(&facility_id).await,
        Err(EngineError::FacilityNotFound(_))
    ));
    // Finished stays stay readable.
    assert_eq!(h.engine.stay(&stay.id).await.unwrap().status, StayStatus::Cancelled);
}

// ── Queries ───────────────────────────────────────────────

#[tokio::test]
async fn guest_stays_in_booking_order() {
    let h = harness("guest_stays.wal");
    let (_, s1) = h.space(5, 0).await;
    let (_, s2) = h.space(5, 0).await;
    let a = h.book(s1, 0, 1, 1, 0).await.unwrap();
    let b = h.book(s2, 0, 1, 1, 0).await.unwrap();
    let c = h.book(s1, 4, 1, 1, 0).await.unwrap();
    h.engine
        .book_stay(&"carol".into(), s1, 0, 1, 1, 0, String::new())
        .await
        .unwrap();

    let ids: Vec<Ulid> = h.engine.stays_of_guest(&GUEST.into()).await.iter().map(|s| s.id).collect();
    assert_eq!(ids, vec![a.id, b.id, c.id]);
    assert_eq!(h.engine.stays_of_space(&s1).await.unwrap().len(), 3);
    assert!(h.engine.stays_of_guest(&"nobody".into()).await.is_empty());
}

#[tokio::test]
async fn events_published_on_channels() {
    let h = harness("notify.wal");
    let mut all = h.engine.notify.subscribe_all();
    let (facility_id, space_id) = h.space(5, 0).await;
    let mut on_space = h.engine.notify.subscribe(space_id);

    let stay = h.book(space_id, 0, 1, 1, 0).await.unwrap();
    match on_space.recv().await.unwrap() {
        Event::StayBooked { id, space_id: s, .. } => {
            assert_eq!(id, stay.id);
            assert_eq!(s, space_id);
        }
        other => panic!("unexpected event {other:?}"),
    }

    assert!(matches!(all.recv().await.unwrap(), Event::FacilityCreated { id, .. } if id == facility_id));
    assert!(matches!(all.recv().await.unwrap(), Event::SpaceAdded { id, .. } if id == space_id));
    assert!(matches!(all.recv().await.unwrap(), Event::StayBooked { id, .. } if id == stay.id));
}

// ── Durability ────────────────────────────────────────────

#[tokio::test]
async fn replay_restores_state() {
    let h = harness("replay.wal");
    let owner = Account::from(OWNER);
    let (facility_id, space_id) = h.space(4, 10).await;
    let kept = h.book(space_id, 0, 2, 2, 40).await.unwrap();
    let cancelled = h.book(space_id, 1, 1, 1, 10).await.unwrap();
    h.engine.modify_stay(&GUEST.into(), kept.id, 0, 3, 2, 20).await.unwrap();
    h.engine.cancel_stay(&GUEST.into(), cancelled.id).await.unwrap();
    h.engine.check_in(&owner, kept.id).await.unwrap();
    let expected_avail = h.engine.availability(&space_id, 0, 4).await.unwrap();
    let expected_stays = h.engine.stays_of_guest(&GUEST.into()).await;
    let balance = h.ledger.balance_of(&owner);

    let replayed = h.restart();
    assert_eq!(replayed.facility_ids().await, vec![facility_id]);
    assert_eq!(replayed.space_ids_of(&facility_id).await.unwrap(), vec![space_id]);
    assert_eq!(replayed.availability(&space_id, 0, 4).await.unwrap(), expected_avail);
    assert_eq!(replayed.stays_of_guest(&GUEST.into()).await, expected_stays);
    // Replay does not pay anyone again.
    assert_eq!(h.ledger.balance_of(&owner), balance);
    assert_ledger_consistent(&replayed).await;
}

#[tokio::test]
async fn compact_wal_preserves_state() {
    let h = harness("compact_state.wal");
    let owner = Account::from(OWNER);
    let (_, space_id) = h.space(4, 10).await;
    for day in 0..20 {
        let stay = h.book(space_id, day, 1, 1, 10).await.unwrap();
        h.engine.modify_stay(&GUEST.into(), stay.id, day, 1, 2, 10).await.unwrap();
        h.engine.cancel_stay(&GUEST.into(), stay.id).await.unwrap();
    }
    let kept = h.book(space_id, 3, 2, 3, 60).await.unwrap();
    h.engine.check_in(&owner, kept.id).await.unwrap_err();
    h.clock.advance_days(3);
    h.engine.check_in(&owner, kept.id).await.unwrap();

    let before_avail = h.engine.availability(&space_id, 0, 20).await.unwrap();
    let before_stays = h.engine.stays_of_space(&space_id).await.unwrap();
    let size_before = std::fs::metadata(&h.path).unwrap().len();
    assert!(h.engine.wal_appends_since_compact().await > 0);

    h.engine.compact_wal().await.unwrap();
    assert_eq!(h.engine.wal_appends_since_compact().await, 0);
    let size_after = std::fs::metadata(&h.path).unwrap().len();
    assert!(size_after < size_before, "compacted WAL ({size_after}) should be smaller than original ({size_before})");

    let replayed = h.restart();
    assert_eq!(replayed.availability(&space_id, 0, 20).await.unwrap(), before_avail);
    assert_eq!(replayed.stays_of_space(&space_id).await.unwrap(), before_stays);
    assert_ledger_consistent(&replayed).await;
}

#[tokio::test]
async fn compaction_survives_shrunk_capacity_and_reused_keys() {
    let h = harness("compact_edge.wal");
    let owner = Account::from(OWNER);
    let old = h.facility("ipfs://reused").await;
    let (_, space_id) = h.space(5, 0).await;

    // A cancelled 5-unit stay on a space that now holds only 2.
    let big = h.book(space_id, 0, 1, 5, 0).await.unwrap();
    h.engine.cancel_stay(&GUEST.into(), big.id).await.unwrap();
    h.book(space_id, 0, 1, 2, 0).await.unwrap();
    h.engine.update_space(&owner, space_id, 2, 0, true, String::new()).await.unwrap();

    // The URI of a deleted facility now belongs to a new one.
    h.engine.delete_facility(&owner, old).await.unwrap();
    let new = h.facility("ipfs://reused").await;

    h.engine.compact_wal().await.unwrap();
    let replayed = h.restart();

    let space = replayed.space(&space_id).await.unwrap();
    assert_eq!(space.capacity, 2);
    assert_eq!(replayed.availability(&space_id, 0, 1).await.unwrap(), vec![0]);
    assert_eq!(replayed.stay(&big.id).await.unwrap().status, StayStatus::Cancelled);
    assert!(!replayed.facility(&old).await.unwrap().exists());
    let result = replayed.register_facility(&owner, "ipfs://reused".into(), true).await;
    assert!(matches!(result, Err(EngineError::DuplicateFacility { .. })));
    assert!(replayed.facility_ids().await.contains(&new));
    assert_ledger_consistent(&replayed).await;
}

#[tokio::test]
async fn compact_then_append_survives_restart() {
    let h = harness("compact_append.wal");
    let (_, space_id) = h.space(3, 0).await;
    h.book(space_id, 0, 1, 1, 0).await.unwrap();
    h.engine.compact_wal().await.unwrap();
    let after = h.book(space_id, 0, 1, 1, 0).await.unwrap();

    let replayed = h.restart();
    assert_eq!(replayed.availability(&space_id, 0, 1).await.unwrap(), vec![1]);
    assert_eq!(replayed.stay(&after.id).await.unwrap(), after);
}

/// Pseudo-random mix of every stay operation; after each step the calendar
/// must match the stays exactly.
#[tokio::test]
async fn ledger_consistent_under_mixed_operations() {
    let h = harness("mixed_ops.wal");
    let owner = Account::from(OWNER);
    let (_, s1) = h.space(3, 1).await;
    let (_, s2) = h.space(1, 1).await;
    let spaces = [s1, s2];
    let mut seed: u64 = 0x5eed;
    let mut next = move |n: u64| {
        seed = seed.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(1_442_695_040_888_963_407);
        (seed >> 33) % n
    };

    let mut stays: Vec<Ulid> = Vec::new();
    for _ in 0..300 {
        match next(7) {
            0 | 1 => {
                let space_id = spaces[next(2) as usize];
                let days = next(4) as u32 + 1;
                let units = next(2) as u32 + 1;
                let day_start = next(15) as Day;
                if let Ok(stay) = h.book(space_id, day_start, days, units, Wei::from(days * units)).await {
                    stays.push(stay.id);
                }
            }
            2 if !stays.is_empty() => {
                let id = stays[next(stays.len() as u64) as usize];
                let days = next(4) as u32 + 1;
                let _ = h
                    .engine
                    .modify_stay(&GUEST.into(), id, next(15) as Day, days, 1, Wei::from(days))
                    .await;
            }
            3 if !stays.is_empty() => {
                let id = stays[next(stays.len() as u64) as usize];
                let _ = h.engine.cancel_stay(&GUEST.into(), id).await;
            }
            4 if !stays.is_empty() => {
                let id = stays[next(stays.len() as u64) as usize];
                let _ = h.engine.check_in(&owner, id).await;
            }
            5 if !stays.is_empty() => {
                let id = stays[next(stays.len() as u64) as usize];
                let _ = h.engine.check_out(&owner, id).await;
            }
            _ => h.clock.advance_days(1),
        }
        assert_ledger_consistent(&h.engine).await;
    }

    h.engine.compact_wal().await.unwrap();
    assert_ledger_consistent(&h.restart()).await;
}
