// This file is part of retrace64.
// Copyright (c) 2021-2023 retrace64 contributors. All rights reserved.
// Licensed under the GPLv3. See LICENSE file in the project root for full license text.

use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;
use std::process;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Context;
use log::info;
use structopt::StructOpt;

use retrace64::io::Cia2;
use retrace64::mem::{BusBridge, Ram, Rom};
use retrace64::sound::{SampleRing, Sid};
use retrace64::trace::{Step, TraceDriver, TraceStream};
use retrace64::types::{SoundOutput, VideoOutput};
use retrace64::util::{new_shared, Clock, IrqLine, Pin};
use retrace64::video::{FrameBuffer, Palette, Vic, DISPLAY_X, DISPLAY_Y, SCREEN_FREQ};

static NAME: &str = "retrace64";

static QUIT_REQUESTED: AtomicBool = AtomicBool::new(false);

/// Presenter for console runs: counts frames, shows nothing.
struct HeadlessPresenter {
    frames: u64,
}

impl VideoOutput for HeadlessPresenter {
    fn dimensions(&self) -> (usize, usize) {
        (DISPLAY_X, DISPLAY_Y)
    }

    fn vblank(&mut self) {
        self.frames += 1;
    }
}

#[derive(StructOpt, Debug)]
#[structopt(name = "retrace64")]
pub struct Opt {
    /// bus capture to replay
    #[structopt(parse(from_os_str), default_value = "c64_pi_dump.bin")]
    pub trace: PathBuf,

    /// filename of the character generator ROM
    #[structopt(long, parse(from_os_str), default_value = "char.rom")]
    pub charset: PathBuf,

    /// stop after this many frames
    #[structopt(long)]
    pub frames: Option<u64>,

    // -- Sound
    /// disable SID filters
    #[structopt(long = "nosidfilters")]
    pub no_sid_filters: bool,
    /// set sound sample rate in Hz
    #[structopt(long = "sound-rate", default_value = "44100")]
    pub sound_rate: u32,

    // -- Logging
    /// set log level
    #[structopt(long = "loglevel", default_value = "info")]
    pub log_level: String,
}

fn main() {
    let opt = Opt::from_args();
    match run(&opt) {
        Ok(_) => process::exit(0),
        Err(err) => {
            eprintln!("Error: {:#}", err);
            process::exit(1)
        }
    }
}

#[cfg(unix)]
fn install_signal_handlers() {
    extern "C" fn handle_signal(_signum: libc::c_int) {
        QUIT_REQUESTED.store(true, Ordering::SeqCst);
    }
    let handler = handle_signal as extern "C" fn(libc::c_int) as libc::sighandler_t;
    unsafe {
        libc::signal(libc::SIGINT, handler);
        libc::signal(libc::SIGTERM, handler);
        libc::signal(libc::SIGQUIT, handler);
        libc::signal(libc::SIGHUP, handler);
    }
}

#[cfg(not(unix))]
fn install_signal_handlers() {}

fn run(opt: &Opt) -> anyhow::Result<()> {
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(opt.log_level.as_str()),
    )
    .init();
    info!("Starting {}", NAME);
    install_signal_handlers();

    // Chip wiring
    let ram = new_shared(Ram::new(0x10000));
    let color_ram = new_shared(Ram::new(0x0400));
    let char_rom = new_shared(Rom::load(&opt.charset, 0x1000)?);
    let frame_buffer = new_shared(FrameBuffer::new(DISPLAY_X, DISPLAY_Y, Palette::default()));
    let ba_line = new_shared(Pin::new_high());
    let irq_line = new_shared(IrqLine::new("irq"));
    let clock = Rc::new(Clock::new());
    let vic = new_shared(Vic::new(
        ram.clone(),
        color_ram.clone(),
        char_rom,
        frame_buffer.clone(),
        ba_line.clone(),
        irq_line,
        clock.clone(),
    ));
    let sid = new_shared(Sid::new(opt.sound_rate, !opt.no_sid_filters));
    let cia2 = new_shared(Cia2::new(vic.clone()));
    let bridge = BusBridge::new(ram, color_ram, vic.clone(), sid.clone(), cia2.clone());

    let file = File::open(&opt.trace)
        .with_context(|| format!("failed to open capture {}", opt.trace.display()))?;
    let stream = TraceStream::new(BufReader::new(file));
    let mut driver = TraceDriver::new(
        stream,
        bridge,
        vic.clone(),
        sid.clone(),
        ba_line,
        clock.clone(),
    );

    vic.borrow_mut().reset();
    sid.borrow_mut().reset();
    cia2.borrow_mut().reset();
    driver.reset();

    info!("Waiting for the machine to reset");
    driver.wait_for_reset()?;

    // Headless presenter and a null audio device: frames are counted,
    // samples are pulled once per frame and dropped
    let mut presenter = HeadlessPresenter { frames: 0 };
    let (width, height) = presenter.dimensions();
    info!("Display {}x{}", width, height);
    let samples_per_frame = (opt.sound_rate / SCREEN_FREQ) as usize;
    let mut sample_buf = vec![0i16; samples_per_frame];
    let mut device_buf = vec![0i16; samples_per_frame];
    let mut sound_out = SampleRing::new(samples_per_frame * 4);

    loop {
        match driver.step()? {
            Step::Eof => {
                info!("End of capture stream ({})", clock.get());
                break;
            }
            Step::Continue => {}
        }
        if QUIT_REQUESTED.load(Ordering::SeqCst) {
            info!("Quit requested ({})", clock.get());
            break;
        }
        if frame_buffer.borrow().get_sync() {
            frame_buffer.borrow_mut().set_sync(false);
            presenter.vblank();
            sid.borrow_mut().calc_buffer(&mut sample_buf);
            sound_out.write(&sample_buf);
            sound_out.drain(&mut device_buf);
            if let Some(limit) = opt.frames {
                if presenter.frames >= limit {
                    info!("Frame limit reached");
                    break;
                }
            }
        }
    }

    if sound_out.dropped() > 0 {
        info!("Dropped {} audio samples", sound_out.dropped());
    }
    info!(
        "Replayed {} bus cycles, {} frames",
        clock.get(),
        presenter.frames
    );
    Ok(())
}
