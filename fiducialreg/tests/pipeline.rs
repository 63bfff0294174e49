//! End-to-end registration of synthetic bead channels.

use approx::assert_relative_eq;
use fidreg_math::ImRef3d;
use fiducialreg::synthetic::{render_beads, scattered_positions, SyntheticBead};
use fiducialreg::{
    ChannelLabel, CloudSet, FiducialCloud, FiducialCloudConfig, MatchingConfig,
    RegistrationError, Threshold, TransformMode,
};
use nalgebra::DMatrix;
use ndarray::Array3;

const SHAPE: (usize, usize, usize) = (32, 64, 64);
const SHIFT: [f64; 3] = [2.0, -1.0, 0.5];

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn bead_config() -> FiducialCloudConfig {
    FiducialCloudConfig {
        xysig: 1.5,
        zsig: 1.5,
        wx: 0.15,
        wz: 0.3,
        ..Default::default()
    }
}

fn beads_at(positions: &[[f64; 3]], shift: [f64; 3]) -> Vec<SyntheticBead> {
    positions
        .iter()
        .map(|p| SyntheticBead::new(*p, 1.5, 1.5, 1000.0).shifted(shift))
        .collect()
}

fn two_channels() -> (Array3<f64>, Array3<f64>) {
    let positions = scattered_positions(10, SHAPE, 7.0, 10.0, 42);
    assert_eq!(positions.len(), 10);
    let reference = render_beads(SHAPE, &beads_at(&positions, [0.0; 3]), 100.0);
    let moved = render_beads(SHAPE, &beads_at(&positions, SHIFT), 100.0);
    (reference, moved)
}

fn wl(nm: i64) -> ChannelLabel {
    ChannelLabel::Wavelength(nm)
}

#[test]
fn test_rigid_shift_between_channels() {
    init_logging();
    let (c488, c560) = two_channels();
    let set = CloudSet::from_volumes(
        vec![c488, c560],
        Some(vec![wl(488), wl(560)]),
        bead_config(),
    )
    .unwrap();
    assert_eq!(set.count(), vec![10, 10]);

    let matched = set.count_matching().unwrap();
    assert_eq!(matched, 10);

    let m = set
        .tform(Some(&wl(560)), Some(&wl(488)), TransformMode::Rigid)
        .unwrap();
    assert_relative_eq!(m[(0, 3)], -2.0, epsilon = 0.05);
    assert_relative_eq!(m[(1, 3)], 1.0, epsilon = 0.05);
    assert_relative_eq!(m[(2, 3)], -0.5, epsilon = 0.05);
    assert_relative_eq!(
        m.view((0, 0), (3, 3)).into_owned(),
        DMatrix::identity(3, 3),
        epsilon = 1e-3
    );
}

#[test]
fn test_every_mode_recovers_the_shift() {
    init_logging();
    let (c488, c560) = two_channels();
    let set = CloudSet::from_volumes(vec![c488, c560], None, bead_config()).unwrap();

    for mode in TransformMode::ALL {
        let m = set.tform(None, None, mode).unwrap();
        for (axis, shift) in SHIFT.iter().enumerate() {
            assert!(
                (m[(axis, 3)] + shift).abs() < 0.1,
                "{mode}: translation {} vs {}",
                m[(axis, 3)],
                -shift
            );
        }
        assert_relative_eq!(m[(3, 3)], 1.0, epsilon = 1e-12);
    }
}

#[test]
fn test_world_units() {
    init_logging();
    let (c488, c560) = two_channels();
    let config = bead_config();
    let set = CloudSet::from_volumes(vec![c488, c560], None, config)
        .unwrap()
        .with_matching_config(MatchingConfig {
            in_world: true,
            ..Default::default()
        });

    let m = set.tform(None, None, TransformMode::Translation).unwrap();
    assert_relative_eq!(m[(0, 3)], -SHIFT[0] * config.dx, epsilon = 5e-3);
    assert_relative_eq!(m[(1, 3)], -SHIFT[1] * config.dx, epsilon = 5e-3);
    assert_relative_eq!(m[(2, 3)], -SHIFT[2] * config.dz, epsilon = 5e-3);

    let report = set
        .registration_report(None, None, TransformMode::Translation)
        .unwrap();
    assert!(report.rms_residual.unwrap() < 0.01);
}

#[test]
fn test_auto_threshold_counts_blobs() {
    init_logging();
    let positions = scattered_positions(6, SHAPE, 7.0, 10.0, 5);
    assert_eq!(positions.len(), 6);
    let volume = render_beads(SHAPE, &beads_at(&positions, [0.0; 3]), 100.0);

    let mut cloud = FiducialCloud::new(volume, bead_config()).unwrap();
    let (threshold, count) = cloud.autothresh().unwrap();
    assert_eq!(count, 6);
    assert!(threshold > 0.0);
    assert_eq!(cloud.count(), 6);
    assert_eq!(cloud.threshold_used(), Some(threshold));

    assert!(cloud.beads().iter().all(|b| b.errors.is_some()));
    let coords = cloud.coords().clone();
    for truth in &positions {
        let nearest = coords
            .column_iter()
            .map(|c| {
                ((c[0] - truth[0]).powi(2) + (c[1] - truth[1]).powi(2) + (c[2] - truth[2]).powi(2))
                    .sqrt()
            })
            .fold(f64::INFINITY, f64::min);
        assert!(nearest < 0.01, "bead at {truth:?} off by {nearest}");
    }

    cloud.set_mincount(Some(3)).unwrap();
    assert_eq!(cloud.count(), 6);

    // a threshold above every response leaves no beads
    cloud.set_threshold(Threshold::Fixed(f64::MAX)).unwrap();
    assert_eq!(cloud.count(), 0);
}

#[test]
fn test_blank_volume_is_empty() {
    init_logging();
    let cloud = FiducialCloud::new(Array3::zeros(SHAPE), bead_config()).unwrap();
    assert_eq!(cloud.coords().shape(), (3, 0));
    assert_eq!(cloud.count(), 0);

    let other = FiducialCloud::new(Array3::zeros(SHAPE), bead_config()).unwrap();
    let set = CloudSet::new(vec![cloud, other], None).unwrap();
    assert!(matches!(
        set.tform(None, None, TransformMode::Rigid),
        Err(RegistrationError::NoMatchingPoints { .. })
    ));
}

#[test]
fn test_unknown_mode_is_named() {
    let (c488, c560) = two_channels();
    let set = CloudSet::from_volumes(vec![c488, c560], None, bead_config()).unwrap();
    let err = set.tform_named(None, None, "nonexistent").unwrap_err();
    assert!(err.to_string().contains("nonexistent"));
}

#[test]
fn test_partial_overlap_matching() {
    let positions = scattered_positions(14, SHAPE, 4.0, 8.0, 17);
    assert_eq!(positions.len(), 14);
    let to_matrix = |points: &[[f64; 3]]| {
        DMatrix::from_fn(3, points.len(), |r, c| points[c][r])
    };

    // beads 0..10 in every channel, 10..12 only in the first, 12..14 only in the second
    let first: Vec<[f64; 3]> = positions[..12].to_vec();
    let second: Vec<[f64; 3]> = positions[..10]
        .iter()
        .chain(positions[12..].iter())
        .map(|p| [p[0] + SHIFT[0], p[1] + SHIFT[1], p[2] + SHIFT[2]])
        .collect();
    let third: Vec<[f64; 3]> = positions[..10]
        .iter()
        .map(|p| [p[0] - 0.5, p[1] + 0.25, p[2]])
        .collect();

    let imref = ImRef3d::new(SHAPE).unwrap();
    let clouds = [first, second, third]
        .iter()
        .map(|points| {
            FiducialCloud::from_coords(to_matrix(points), imref, FiducialCloudConfig::default())
                .unwrap()
        })
        .collect();
    let set = CloudSet::new(clouds, None).unwrap();

    let matched = set.matching().unwrap();
    assert_eq!(matched.len(), 3);
    assert!(matched.iter().all(|m| m.ncols() == 10));

    let m = set
        .tform(Some(&wl(1)), Some(&wl(0)), TransformMode::Affine)
        .unwrap();
    assert_relative_eq!(m[(0, 3)], -SHIFT[0], epsilon = 1e-9);
    assert_relative_eq!(m[(2, 3)], -SHIFT[2], epsilon = 1e-9);
}

#[test]
fn test_disjoint_clouds_with_distance_cutoff() {
    let positions = scattered_positions(8, SHAPE, 4.0, 8.0, 29);
    let first = DMatrix::from_fn(3, positions.len(), |r, c| positions[c][r]);
    // the second channel lies entirely past the far x face of the first
    let second = first.map_with_location(|r, _, v| if r == 0 { v + 100.0 } else { v });

    let imref = ImRef3d::new(SHAPE).unwrap();
    let clouds = vec![
        FiducialCloud::from_coords(first, imref, FiducialCloudConfig::default()).unwrap(),
        FiducialCloud::from_coords(second, imref, FiducialCloudConfig::default()).unwrap(),
    ];
    let set = CloudSet::new(clouds, None)
        .unwrap()
        .with_matching_config(MatchingConfig {
            max_distance: Some(5.0),
            ..Default::default()
        });

    assert_eq!(set.count(), vec![8, 8]);
    assert!(matches!(
        set.count_matching(),
        Err(RegistrationError::NoMatchingPoints { .. })
    ));
    assert!(matches!(
        set.tform(None, None, TransformMode::Rigid),
        Err(RegistrationError::NoMatchingPoints { .. })
    ));
}
