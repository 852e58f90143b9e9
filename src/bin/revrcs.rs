#![allow(warnings)]
#![allow(dead_code)]

mod common;
mod io;

use clap::{App, AppSettings, Arg, ArgMatches};

use std::collections::HashMap;
use std::time::Instant;

use common::*;
use io::*;
use revrc::api::*;
use revrc::rc::{PicDetails, Scheduled, QSCALE_Q_FAC};

// bits the synthetic encoder spends per unit of SAD at qscale 1
const BITS_PER_SAD: u64 = 1;

struct CLISettings {
    pub input: Box<dyn demuxer::Demuxer>,
    pub rc: RcConfig,
    pub frames: usize,
    pub verbose: bool,
}

fn parse_cli() -> std::io::Result<CLISettings> {
    let mut app = App::new("revrcs")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Rust EVC Rate Control Simulator")
        .setting(AppSettings::DeriveDisplayOrder)
        .setting(AppSettings::SubcommandsNegateReqs)
        .arg(
            Arg::with_name("FULLHELP")
                .help("Prints more detailed help information")
                .long("fullhelp"),
        )
        .arg(
            Arg::with_name("INPUT")
                .help("file name of input video (y4m)")
                .short("i")
                .long("input")
                .required_unless("FULLHELP")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("MODE")
                .help("rate control mode (cbr, vbr, cqp)")
                .short("m")
                .long("mode")
                .takes_value(true)
                .default_value("cbr"),
        )
        .arg(
            Arg::with_name("BITRATE")
                .help("Bitrate (kbps)")
                .short("b")
                .long("bitrate")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("PEAK_BITRATE")
                .help("Peak bitrate (kbps), vbr only")
                .long("peak")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("VBV")
                .help("VBV buffer size (kbits)")
                .long("vbv")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("DELAY")
                .help("VBV buffer delay (ms)")
                .long("delay")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("MINQP")
                .help("Minimum quantizer (1-51) to use in bitrate mode")
                .long("minqp")
                .takes_value(true)
                .default_value("1"),
        )
        .arg(
            Arg::with_name("MAXQP")
                .help("Maximum quantizer (1-51) to use in bitrate mode")
                .long("maxqp")
                .takes_value(true)
                .default_value("51"),
        )
        .arg(
            Arg::with_name("QP")
                .help("I picture QP value (0-51) in cqp mode")
                .short("q")
                .long("qp")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("FRAME_RATE")
                .help("frame rate (Hz), overrides the input header")
                .short("z")
                .long("frame-rate")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("KEYFRAME_INTERVAL")
                .help("Intra frame interval")
                .short("p")
                .long("intra")
                .alias("keyint")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("INTER_INTERVAL")
                .help("Inter frame interval, B pictures between references plus one")
                .short("g")
                .long("inter")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("MAX_INTER_INTERVAL")
                .help("Maximum inter frame interval")
                .long("max-inter")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("IDR_PERIOD")
                .help("IDR period")
                .long("idr")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("CLOSED_GOP")
                .help("use closed GOP structure. if not set, open GOP is used")
                .long("closed-gop")
                .alias("closed_gop"),
        )
        .arg(
            Arg::with_name("FRAMES")
                .help("maximum number of frames to be coded")
                .short("f")
                .long("frames")
                .takes_value(true)
                .default_value("0"),
        )
        // DEBUGGING
        .arg(
            Arg::with_name("VERBOSE")
                .help("Verbose logging; outputs info for every frame")
                .long("verbose")
                .short("v"),
        );

    let matches = app.clone().get_matches();

    if matches.is_present("FULLHELP") {
        app.print_long_help().map_err(|e| {
            std::io::Error::new(std::io::ErrorKind::Other, e.to_string())
        })?;
        std::process::exit(0);
    }

    let input = demuxer::new(matches.value_of("INPUT").unwrap_or("-"))?;
    let (width, height) = input.size();
    let rc = parse_config(&matches, input.frame_rate(), width, height)?;

    Ok(CLISettings {
        input,
        rc,
        frames: matches
            .value_of("FRAMES")
            .unwrap_or("0")
            .parse()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?,
        verbose: matches.is_present("VERBOSE"),
    })
}

// SADs measured when a picture arrives in display order
struct PicSad {
    intra: u64,
    inter: u64,
}

fn code_picture(
    ctx: &mut Context,
    pic: &PicDetails,
    sads: &mut HashMap<i32, PicSad>,
    progress: &mut ProgressInfo,
    verbose: bool,
) {
    let sad = match sads.remove(&pic.pic_id) {
        Some(s) if pic.pic_type == PictureType::I => s.intra,
        Some(s) => s.inter,
        None => 0,
    }
    .max(1);

    let target = ctx.target_bits(pic.pic_type);
    let qp = ctx.frame_qp(pic.pic_type, target);
    let bits = (BITS_PER_SAD * sad * (1 << QSCALE_Q_FAC) / qp.qscale_q6.max(1) as u64)
        .min(i32::MAX as u64) as i32;

    let status = ctx.update(&FrameStats {
        pic_type: pic.pic_type,
        consumed_bits: bits,
        sad,
        avg_qp_q6: qp.qscale_q6,
        num_skips: 0,
        is_scd: pic.is_scd,
        is_non_ref: pic.pic_type == PictureType::B,
    });

    let summary = FrameSummary {
        pic_id: pic.pic_id,
        pic_type: pic.pic_type,
        qp: qp.qp,
        target_bits: qp.target_bits,
        bits,
        status,
    };
    if verbose {
        eprintln!("{}", summary);
    }
    progress.add_frame(summary);
}

fn main() -> std::io::Result<()> {
    let mut cli = parse_cli()?;
    let mut ctx = Context::new(&cli.rc)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;

    let total = if cli.frames > 0 { Some(cli.frames) } else { None };
    let mut progress = ProgressInfo::new(cli.input.frame_rate(), total);
    let mut sads: HashMap<i32, PicSad> = HashMap::new();
    let mut prev: Option<LumaFrame> = None;
    let mut pic_id = 0;

    loop {
        if cli.frames > 0 && pic_id as usize >= cli.frames {
            break;
        }
        let frame = match cli.input.read() {
            Ok(frame) => frame,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e),
        };

        let intra = frame.intra_sad();
        let inter = match &prev {
            Some(p) => frame.inter_sad(p),
            None => intra,
        };
        sads.insert(pic_id, PicSad { intra, inter });
        prev = Some(frame);

        ctx.add_picture(pic_id, PicHint::Auto);
        pic_id += 1;

        while let Scheduled::Picture(pic) = ctx.get_picture() {
            code_picture(&mut ctx, &pic, &mut sads, &mut progress, cli.verbose);
        }
    }

    if pic_id > 0 {
        ctx.flush();
        while let Scheduled::Picture(pic) = ctx.get_picture() {
            code_picture(&mut ctx, &pic, &mut sads, &mut progress, cli.verbose);
        }
    }

    eprintln!("{}", progress);
    println!("{}", progress.print_summary());
    Ok(())
}
