//! Registers two bead channels and prints the resulting matrix.
//!
//! Without input files two synthetic channels are generated, the second one
//! shifted by `--shift`. With `--fixed` and `--moving` two TIFF stacks are
//! loaded instead.
//!
//! # Usage
//!
//! ```bash
//! # Synthetic beads, default rigid registration
//! cargo run --release --example register_beads
//!
//! # Synthetic beads with a custom shift, every mode
//! cargo run --release --example register_beads -- --shift 1.5,-0.5,0.8 --mode all
//!
//! # Real data, write the registration file
//! RUST_LOG=info cargo run --release --example register_beads -- \
//!     --fixed beads_488.tif --moving beads_560.tif --dx 0.104 --dz 0.4 \
//!     --mode 2step --output registration.json
//! ```

use std::path::PathBuf;

use clap::Parser;
use fiducialreg::synthetic::{add_noise, render_beads, scattered_positions, SyntheticBead};
use fiducialreg::{
    CameraNoiseModel, ChannelLabel, CloudSet, FiducialCloud, FiducialCloudConfig, TransformMode,
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Reference channel TIFF stack
    #[arg(long, requires = "moving")]
    fixed: Option<PathBuf>,

    /// Channel TIFF stack to register onto the reference
    #[arg(long, requires = "fixed")]
    moving: Option<PathBuf>,

    /// Transform mode, or "all"
    #[arg(short, long, default_value = "rigid")]
    mode: String,

    /// Lateral voxel size
    #[arg(long, default_value_t = 0.1)]
    dx: f64,

    /// Axial voxel size
    #[arg(long, default_value_t = 0.2)]
    dz: f64,

    /// Lateral LoG sigma in pixels
    #[arg(long, default_value_t = 1.5)]
    xysig: f64,

    /// Axial LoG sigma in pixels
    #[arg(long, default_value_t = 1.5)]
    zsig: f64,

    /// Minimum plausible bead count for the auto threshold
    #[arg(long)]
    mincount: Option<usize>,

    /// Shift (x,y,z pixels) of the synthetic moving channel
    #[arg(long, value_delimiter = ',', default_values_t = [2.0, -1.0, 0.5])]
    shift: Vec<f64>,

    /// Number of synthetic beads
    #[arg(long, default_value_t = 12)]
    beads: usize,

    /// Random seed for the synthetic volumes
    #[arg(long, default_value_t = 1)]
    seed: u64,

    /// Write a registration file with the matrix
    #[arg(short, long)]
    output: Option<PathBuf>,
}

fn synthetic_clouds(
    args: &Args,
    config: FiducialCloudConfig,
) -> Result<Vec<FiducialCloud>, Box<dyn std::error::Error>> {
    let shape = (40, 96, 96);
    let shift = match args.shift.as_slice() {
        [x, y, z] => [*x, *y, *z],
        other => return Err(format!("--shift needs 3 values, got {}", other.len()).into()),
    };

    let positions = scattered_positions(args.beads, shape, 8.0, 10.0, args.seed);
    println!("Rendering {} synthetic beads, shift {:?} px", positions.len(), shift);

    let noise = CameraNoiseModel::default();
    let mut clouds = Vec::with_capacity(2);
    for (channel, offset) in [[0.0; 3], shift].into_iter().enumerate() {
        let beads: Vec<SyntheticBead> = positions
            .iter()
            .map(|p| SyntheticBead::new(*p, 1.5, 1.5, 2000.0).shifted(offset))
            .collect();
        let mut volume = render_beads(shape, &beads, 100.0);
        add_noise(&mut volume, &noise, args.seed + channel as u64);
        clouds.push(FiducialCloud::new(volume, config)?);
    }
    Ok(clouds)
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Args::parse();

    let config = FiducialCloudConfig {
        dx: args.dx,
        dz: args.dz,
        xysig: args.xysig,
        zsig: args.zsig,
        mincount: args.mincount,
        wx: 1.5 * args.dx,
        wz: 1.5 * args.dz,
        ..Default::default()
    };

    let clouds = match (&args.fixed, &args.moving) {
        (Some(fixed), Some(moving)) => vec![
            FiducialCloud::from_tiff(fixed, config)?,
            FiducialCloud::from_tiff(moving, config)?,
        ],
        _ => synthetic_clouds(&args, config)?,
    };

    let fixed = ChannelLabel::from("fixed");
    let moving = ChannelLabel::from("moving");
    let set = CloudSet::new(clouds, Some(vec![fixed.clone(), moving.clone()]))?;
    println!("Beads per channel: {:?}", set.count());
    println!("Matched beads: {}", set.count_matching()?);

    let modes: Vec<TransformMode> = if args.mode == "all" {
        TransformMode::ALL.to_vec()
    } else {
        vec![args.mode.parse()?]
    };

    for mode in &modes {
        let report = set.registration_report(Some(&moving), Some(&fixed), *mode)?;
        println!();
        println!("Mode: {}", mode);
        for row in &report.matrix {
            let cells: Vec<String> = row.iter().map(|v| format!("{v:>10.5}")).collect();
            println!("  [{}]", cells.join(", "));
        }
        if let Some(rms) = report.rms_residual {
            println!("  RMS residual on matched beads: {rms:.4} px");
        }
    }

    if let Some(path) = &args.output {
        let file = set.registration_file(Some(&fixed), modes[0])?;
        file.save(path)?;
        println!();
        println!("Wrote {}", path.display());
    }

    Ok(())
}
