//! End-to-end pours through a [`Station`] with recorded pumps and an in-memory database

use std::sync::Arc;
use std::time::Duration;

use rusqlite::Connection;

use cocktail_dispenser::availability::ShortfallReason;
use cocktail_dispenser::db;
use cocktail_dispenser::dispense::{AbortReason, RunState};
use cocktail_dispenser::models::Amount;
use cocktail_dispenser::testing::RecordingPumps;
use cocktail_dispenser::{Config, PourError, Station};

/// Cuba Libre (50 rum / 150 cola / 10 lime + ice) on a four slot machine:
/// rum 700ml @ 5ml/s, cola 1000ml @ 8ml/s, lime 250ml @ 4ml/s.
fn stocked_station(pumps: Arc<RecordingPumps>) -> (Station, i64) {
    let config = Config {
        slot_count: 4,
        ..Config::default()
    };
    let station = Station::new(config, Connection::open_in_memory().unwrap(), pumps).unwrap();

    let recipe_id = station
        .with_db(|conn| {
            let rum = db::add_ingredient(conn, "Rum")?;
            let cola = db::add_ingredient(conn, "Cola")?;
            let lime = db::add_ingredient(conn, "Lime juice")?;
            let ice = db::add_ingredient(conn, "Ice")?;

            let id = db::add_recipe(conn, "Cuba Libre", None, None, None)?;
            db::add_recipe_line(conn, id, rum, &Amount::Quantity(50.0), "ml")?;
            db::add_recipe_line(conn, id, cola, &Amount::Quantity(150.0), "ml")?;
            db::add_recipe_line(conn, id, lime, &Amount::Quantity(10.0), "ml")?;
            db::add_recipe_line(conn, id, ice, &Amount::Quantity(4.0), "pcs")?;

            for (slot, ingredient, volume, rate) in
                [(0, rum, 700.0, 5.0), (1, cola, 1000.0, 8.0), (2, lime, 250.0, 4.0)]
            {
                db::bind(conn, slot, Some(ingredient))?;
                db::set_volume(conn, slot, volume)?;
                db::set_calibration(conn, slot, Some(rate))?;
            }
            Ok(id)
        })
        .unwrap();

    (station, recipe_id)
}

fn volume(station: &Station, slot: usize) -> f64 {
    station.reservoirs().unwrap()[slot].current_volume_ml
}

fn log_len(station: &Station) -> usize {
    station.with_db(|conn| db::pour_log(conn, 100)).unwrap().len()
}

#[tokio::test(start_paused = true)]
async fn completed_pour_debits_reservoirs_and_logs() {
    let pumps = Arc::new(RecordingPumps::new());
    let (station, recipe_id) = stocked_station(pumps.clone());

    let report = station.pour(recipe_id, 200.0).await.unwrap();

    assert!(report.is_completed());
    assert!(report.settlement.is_clean());
    assert_eq!(report.scaled.len(), 3);
    assert_eq!(pumps.started(), vec![0, 1, 2]);

    let rum_hold = pumps.hold_times(0)[0].as_secs_f64();
    assert!((rum_hold - 9.524).abs() < 0.01);

    assert!((volume(&station, 0) - (700.0 - 47.619)).abs() < 0.01);
    assert!((volume(&station, 1) - (1000.0 - 142.857)).abs() < 0.01);
    assert!((volume(&station, 2) - (250.0 - 9.524)).abs() < 0.01);

    let log = station.with_db(|conn| db::pour_log(conn, 10)).unwrap();
    assert_eq!(log.len(), 1);
    assert_eq!(Some(log[0].id), report.log_id);
    assert_eq!(log[0].recipe_id, Some(recipe_id));
    assert_eq!(log[0].recipe_name.as_deref(), Some("Cuba Libre"));
    assert_eq!(log[0].size_ml, 200.0);
    assert!(!station.is_busy());
}

#[tokio::test(start_paused = true)]
async fn settled_volume_matches_what_was_dispensed() {
    let (station, recipe_id) = stocked_station(Arc::new(RecordingPumps::new()));
    let before: f64 = station.reservoirs().unwrap().iter().map(|r| r.current_volume_ml).sum();

    let report = station.pour(recipe_id, 300.0).await.unwrap();

    let after: f64 = station.reservoirs().unwrap().iter().map(|r| r.current_volume_ml).sum();
    assert!((before - after - 300.0).abs() < 1e-6);
    assert!((report.outcome.total_dispensed() - 300.0).abs() < 1e-6);
    let debited: f64 = report.settlement.changes.iter().map(|c| c.dispensed_ml).sum();
    assert!((debited - 300.0).abs() < 1e-6);
}

#[tokio::test(start_paused = true)]
async fn pump_fault_debits_only_what_ran() {
    let pumps = Arc::new(RecordingPumps::new());
    pumps.fail_on(1);
    let (station, recipe_id) = stocked_station(pumps.clone());

    let report = station.pour(recipe_id, 200.0).await.unwrap();

    assert!(matches!(
        report.outcome.state,
        RunState::Aborted(AbortReason::ActuationFault { slot: 1, .. })
    ));
    assert_eq!(pumps.started(), vec![0]);
    assert!(!pumps.is_on(1));
    assert!((volume(&station, 0) - (700.0 - 47.619)).abs() < 0.01);
    assert_eq!(volume(&station, 1), 1000.0);
    assert_eq!(volume(&station, 2), 250.0);
    assert_eq!(report.log_id, None);
    assert_eq!(log_len(&station), 0);
}

#[tokio::test(start_paused = true)]
async fn shortfall_runs_no_pump() {
    let pumps = Arc::new(RecordingPumps::new());
    let (station, recipe_id) = stocked_station(pumps.clone());
    station.with_db(|conn| db::set_volume(conn, 1, 100.0)).unwrap();

    let shortfalls = match station.pour(recipe_id, 200.0).await {
        Err(PourError::Shortfall(shortfalls)) => shortfalls,
        other => panic!("expected a shortfall, got {:?}", other.map(|r| r.outcome.state)),
    };
    assert_eq!(shortfalls.len(), 1);
    assert_eq!(shortfalls[0].ingredient_name, "Cola");
    assert_eq!(shortfalls[0].reason, ShortfallReason::Insufficient { slot: 1 });
    assert!(pumps.events().is_empty());
    assert_eq!(volume(&station, 0), 700.0);
    assert!(!station.is_busy());
}

#[tokio::test(start_paused = true)]
async fn unbound_ingredient_is_reported() {
    let pumps = Arc::new(RecordingPumps::new());
    let (station, recipe_id) = stocked_station(pumps.clone());
    station.with_db(|conn| db::bind(conn, 2, None)).unwrap();

    let Err(PourError::Shortfall(shortfalls)) = station.pour(recipe_id, 200.0).await else {
        panic!("expected a shortfall");
    };
    assert_eq!(shortfalls[0].ingredient_name, "Lime juice");
    assert_eq!(shortfalls[0].reason, ShortfallReason::Unassigned);
    assert!(pumps.events().is_empty());

    let available = station.available_recipes().unwrap();
    assert!(available.is_empty());
}

#[tokio::test(start_paused = true)]
async fn second_run_is_rejected_while_busy() {
    let pumps = Arc::new(RecordingPumps::new());
    let (station, recipe_id) = stocked_station(pumps.clone());

    let pour = tokio::spawn({
        let station = station.clone();
        async move { station.pour(recipe_id, 200.0).await }
    });
    while !station.is_busy() {
        tokio::task::yield_now().await;
    }

    assert!(matches!(station.pour(recipe_id, 200.0).await, Err(PourError::Busy)));
    assert!(matches!(station.calibration_run(3).await, Err(PourError::Busy)));
    assert!(matches!(station.clean().await, Err(PourError::Busy)));

    let report = pour.await.unwrap().unwrap();
    assert!(report.is_completed());
    assert!(!station.is_busy());
    assert_eq!(log_len(&station), 1);
}

#[tokio::test(start_paused = true)]
async fn emergency_stop_settles_partial_pour() {
    let pumps = Arc::new(RecordingPumps::new());
    let (station, recipe_id) = stocked_station(pumps.clone());

    let pour = tokio::spawn({
        let station = station.clone();
        async move { station.pour(recipe_id, 200.0).await }
    });
    while !pumps.is_on(0) {
        tokio::task::yield_now().await;
    }

    // Rum runs for about 9.5s; stop it after 2s
    tokio::time::sleep(Duration::from_secs(2)).await;
    station.emergency_stop();
    let report = pour.await.unwrap().unwrap();

    assert_eq!(
        report.outcome.state,
        RunState::Aborted(AbortReason::Cancelled { slot: Some(0) })
    );
    assert_eq!(pumps.started(), vec![0]);
    assert!((0..4).all(|slot| !pumps.is_on(slot)));
    assert!((report.outcome.dispensed[&0] - 10.0).abs() < 0.05);
    assert!((volume(&station, 0) - 690.0).abs() < 0.05);
    assert_eq!(volume(&station, 1), 1000.0);
    assert_eq!(report.log_id, None);
    assert_eq!(log_len(&station), 0);
    assert!(!station.is_busy());
}

#[tokio::test(start_paused = true)]
async fn emergency_stop_when_idle_only_switches_pumps_off() {
    let pumps = Arc::new(RecordingPumps::new());
    let (station, recipe_id) = stocked_station(pumps.clone());

    station.emergency_stop();

    let report = station.pour(recipe_id, 200.0).await.unwrap();
    assert!(report.is_completed());
}

#[tokio::test(start_paused = true)]
async fn missing_and_unscalable_recipes_are_told_apart() {
    let pumps = Arc::new(RecordingPumps::new());
    let (station, _) = stocked_station(pumps.clone());
    let garnish_only = station
        .with_db(|conn| {
            let mint = db::add_ingredient(conn, "Mint")?;
            let id = db::add_recipe(conn, "Mint sprig", None, None, None)?;
            db::add_recipe_line(conn, id, mint, &Amount::Quantity(3.0), "leaves")?;
            Ok(id)
        })
        .unwrap();

    assert!(matches!(
        station.pour(9999, 200.0).await,
        Err(PourError::RecipeNotFound(_))
    ));
    assert!(matches!(
        station.pour(garnish_only, 200.0).await,
        Err(PourError::RecipeNotScalable { recipe_id, .. }) if recipe_id == garnish_only
    ));
    assert!(matches!(
        station.preview(garnish_only, 200.0),
        Err(PourError::RecipeNotScalable { .. })
    ));
    assert!(pumps.events().is_empty());
    assert!(!station.is_busy());
}

#[tokio::test(start_paused = true)]
async fn invalid_target_volume_is_rejected() {
    let pumps = Arc::new(RecordingPumps::new());
    let (station, recipe_id) = stocked_station(pumps.clone());

    for target in [0.0, -50.0, f64::NAN] {
        assert!(matches!(
            station.pour(recipe_id, target).await,
            Err(PourError::InvalidTargetVolume(_))
        ));
    }
    assert!(pumps.events().is_empty());
}

#[tokio::test(start_paused = true)]
async fn dropped_pour_switches_pump_off_without_settling() {
    let pumps = Arc::new(RecordingPumps::new());
    let (station, recipe_id) = stocked_station(pumps.clone());

    let result = tokio::time::timeout(Duration::from_secs(2), station.pour(recipe_id, 200.0)).await;

    assert!(result.is_err());
    assert_eq!(pumps.started(), vec![0]);
    assert!(!pumps.is_on(0));
    assert_eq!(volume(&station, 0), 700.0);
    assert_eq!(log_len(&station), 0);
    assert!(!station.is_busy());
}
