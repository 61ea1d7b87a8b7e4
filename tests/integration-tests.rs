//! End-to-end scenarios: preprocessor to laptime pipelines through the
//! registry, warm-start reuse, and trajectory round-trips.

use raceline_core::prelude::*;
use raceline_core::laptime::InitialCondition;
use raceline_core::track::preprocessor::Coordinates;
use raceline_core::track::R_EARTH;
use raceline_core::utils::almost_eq;

use std::f64::consts::PI;
use std::sync::Arc;

/// Closed ring track helper shared by the scenarios.
fn ring_track(radius: f64, half_width: f64, n: usize) -> Track {
    let length = 2.0 * PI * radius;
    let s: Vec<f64> = (0..n).map(|i| length * i as f64 / n as f64).collect();
    let theta: Vec<f64> = s.iter().map(|si| si / radius + 0.5 * PI).collect();
    let kappa = vec![1.0 / radius; n];
    let centerline: Vec<[f64; 2]> = s
        .iter()
        .map(|si| {
            let a = si / radius;
            [radius * a.cos(), radius * a.sin()]
        })
        .collect();
    Track::new(
        s,
        theta,
        kappa,
        vec![half_width; n],
        vec![half_width; n],
        centerline,
        length,
        true,
    )
    .unwrap()
}

/// Rounded-rectangle boundary polylines in geodetic coordinates: two pairs
/// of straights joined by four arcs of radius `r`.
fn rounded_rectangle(
    length: f64,
    width: f64,
    r: f64,
    half_track_width: f64,
    samples_per_arc: usize,
) -> (Vec<Coordinates>, Vec<Coordinates>) {
    let deg = PI / 180.0;
    let mut center: Vec<[f64; 2]> = Vec::new();
    let mut heading: Vec<f64> = Vec::new();
    let straight_samples = samples_per_arc * 2;
    let push_straight =
        |center: &mut Vec<[f64; 2]>, heading: &mut Vec<f64>, from: [f64; 2], to: [f64; 2], th: f64| {
            for i in 0..straight_samples {
                let t = i as f64 / straight_samples as f64;
                center.push([
                    from[0] + t * (to[0] - from[0]),
                    from[1] + t * (to[1] - from[1]),
                ]);
                heading.push(th);
            }
        };
    let push_arc =
        |center: &mut Vec<[f64; 2]>, heading: &mut Vec<f64>, c: [f64; 2], th_from: f64, th_to: f64| {
            for i in 0..samples_per_arc {
                let t = i as f64 / samples_per_arc as f64;
                let th = th_from + t * (th_to - th_from);
                center.push([
                    c[0] + r * (th - 0.5 * PI).cos(),
                    c[1] + r * (th - 0.5 * PI).sin(),
                ]);
                heading.push(th);
            }
        };
    push_straight(&mut center, &mut heading, [0.0, 0.0], [length, 0.0], 0.0);
    push_arc(&mut center, &mut heading, [length, r], 0.0, 0.5 * PI);
    push_straight(
        &mut center,
        &mut heading,
        [length + r, r],
        [length + r, r + width],
        0.5 * PI,
    );
    push_arc(&mut center, &mut heading, [length, r + width], 0.5 * PI, PI);
    push_straight(
        &mut center,
        &mut heading,
        [length, 2.0 * r + width],
        [0.0, 2.0 * r + width],
        PI,
    );
    push_arc(&mut center, &mut heading, [0.0, r + width], PI, 1.5 * PI);
    push_straight(&mut center, &mut heading, [-r, r + width], [-r, r], 1.5 * PI);
    push_arc(&mut center, &mut heading, [0.0, r], 1.5 * PI, 2.0 * PI);

    let lat0 = 45.0_f64;
    let to_geo = |p: [f64; 2]| Coordinates {
        longitude: p[0] / (R_EARTH * (lat0 * deg).cos()) / deg,
        latitude: p[1] / R_EARTH / deg + lat0,
    };
    let mut left = Vec::new();
    let mut right = Vec::new();
    for (p, th) in center.iter().zip(heading.iter()) {
        let normal = [-th.sin(), th.cos()];
        left.push(to_geo([
            p[0] + half_track_width * normal[0],
            p[1] + half_track_width * normal[1],
        ]));
        right.push(to_geo([
            p[0] - half_track_width * normal[0],
            p[1] - half_track_width * normal[1],
        ]));
    }
    (left, right)
}

fn init_logging() {
    env_logger::builder().is_test(true).try_init().ok();
}

#[test]
fn test_closed_kart_lap_is_reproducible() {
    init_logging();
    let mut registry = Registry::new();
    registry
        .insert_track("ring", ring_track(35.0, 3.5, 128))
        .unwrap();
    registry
        .insert_vehicle(
            "kart",
            Vehicle::from_kind("kart-6dof", &ParameterSet::default()).unwrap(),
        )
        .unwrap();

    let options = LaptimeOptions {
        steady_state_speed: 12.0,
        ..Default::default()
    };
    let first = registry
        .optimal_laptime("kart", "ring", 12, &options)
        .unwrap();
    assert!(first.laptime > 0.0);

    // time is monotone along the lap
    let layout = *registry.vehicle("kart").unwrap().layout();
    for w in first.q.windows(2) {
        assert!(w[1][layout.i_time] > w[0][layout.i_time]);
    }

    registry.delete_variables_by_prefix("run/");
    let second = registry
        .optimal_laptime("kart", "ring", 12, &options)
        .unwrap();
    assert!(almost_eq(first.laptime, second.laptime, Some(1e-6)));
}

#[test]
fn test_preprocessor_to_laptime_pipeline() {
    init_logging();
    let (left, right) = rounded_rectangle(140.0, 60.0, 25.0, 5.5, 10);
    let preprocessor = TrackPreprocessor::new(TrackPreprocessorOptions::default());
    let track = preprocessor.closed(&left, &right, false, 40).unwrap();
    assert!(track.left_boundary_l2_error < 0.15);
    assert!(track.right_boundary_l2_error < 0.15);

    let mut registry = Registry::new();
    registry.insert_track("circuit", track).unwrap();
    registry
        .insert_vehicle(
            "car",
            Vehicle::from_kind("f1-3dof", &ParameterSet::default()).unwrap(),
        )
        .unwrap();
    let options = LaptimeOptions {
        steady_state_speed: 25.0,
        ..Default::default()
    };
    let solution = registry
        .optimal_laptime("car", "circuit", 14, &options)
        .unwrap();
    assert!(solution.laptime > 0.0);

    // outputs landed in the registry tables
    assert!(registry.scalar("run/laptime").unwrap() > 0.0);
    assert_eq!(
        registry.vector("run/delta").unwrap().len(),
        solution.s.len()
    );
}

#[test]
fn test_open_f1_run_pins_the_start() {
    let mut car = F1Car::default();
    let surface = TrackSurface::new(ring_track(150.0, 6.0, 128)).unwrap();
    car.change_track(Arc::new(surface));

    let start = InitialCondition {
        q: vec![40.0, 0.0, 40.0 / 150.0, 0.0, 0.0, 0.0],
        qa: vec![0.3, 0.3, 0.3, 0.3],
        u: vec![0.0, 0.2, 0.6],
    };
    let options = LaptimeOptions {
        initial_condition: Some(start.clone()),
        ..Default::default()
    };
    let solver = OptimalLaptime::new(&car, options);
    let solution = solver.compute_segment(0.0, 400.0, 16).unwrap();
    assert!(solution.laptime > 0.0);
    assert_eq!(solution.q[0][0], start.q[0]);
    assert_eq!(solution.u[0], start.u);
}

#[test]
fn test_gg_diagram_envelope() {
    let mut registry = Registry::new();
    registry
        .insert_vehicle(
            "car",
            Vehicle::from_kind("f1-3dof", &ParameterSet::default()).unwrap(),
        )
        .unwrap();
    let gg = registry.gg_diagram("car", 30.0, 9, "gg/").unwrap();
    for i in 0..gg.ay.len() {
        assert!(gg.ax_max[i] > gg.ax_min[i]);
    }
    let mid = gg.ay.len() / 2;
    assert!(gg.ax_max[mid] > 0.0);
    assert!(gg.ax_min[mid] < 0.0);
    assert_eq!(registry.vector("gg/ay").unwrap().len(), 9);
}

#[test]
fn test_solution_file_roundtrip() {
    let mut registry = Registry::new();
    registry
        .insert_track("ring", ring_track(120.0, 5.0, 96))
        .unwrap();
    registry
        .insert_vehicle(
            "car",
            Vehicle::from_kind("f1-3dof", &ParameterSet::default()).unwrap(),
        )
        .unwrap();
    let options = LaptimeOptions {
        steady_state_speed: 30.0,
        ..Default::default()
    };
    let solution = registry
        .optimal_laptime("car", "ring", 8, &options)
        .unwrap();

    let path = std::env::temp_dir().join("raceline-core-roundtrip.json");
    solution.to_file(&path).unwrap();
    let restored = LaptimeSolution::from_file(&path).unwrap();
    std::fs::remove_file(&path).ok();
    assert_eq!(solution.q, restored.q);
    assert_eq!(solution.qa, restored.qa);
    assert_eq!(solution.u, restored.u);
}
