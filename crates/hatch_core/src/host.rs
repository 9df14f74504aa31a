//! What the hosting application hands to a loaded program.
//!
//! The entry module builds its own simulation on top of a binary module's
//! exports and drives it once per tick with a [`Surface`] and the current
//! [`InputState`].
//!
//! A binary module that draws for itself imports the surface and the input
//! directly: [`surface_imports`] and [`input_imports`] bind them to symbols
//! that take and return plain numbers.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use crate::binary::{host_func, ImportTable, Val};

pub const DEFAULT_TICK_PERIOD: Duration = Duration::from_millis(25);

/// Controller flags, written by the host's input glue and read every tick.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputState {
    pub boost: bool,
    pub left: bool,
    pub right: bool,
    pub shoot: bool,
}

impl InputState {
    pub const BOOST: i32 = 1;
    pub const LEFT: i32 = 2;
    pub const RIGHT: i32 = 4;
    pub const SHOOT: i32 = 8;

    /// The flags packed into one integer for a binary module.
    pub fn bits(&self) -> i32 {
        [
            (self.boost, Self::BOOST),
            (self.left, Self::LEFT),
            (self.right, Self::RIGHT),
            (self.shoot, Self::SHOOT),
        ]
        .iter()
        .filter(|(set, _)| *set)
        .fold(0, |bits, (_, flag)| bits | flag)
    }
}

/// Canvas-like drawing target.
pub trait Surface {
    fn width(&self) -> f64;
    fn height(&self) -> f64;

    fn set_fill_style(&mut self, style: &str);
    fn set_stroke_style(&mut self, style: &str);
    fn set_font(&mut self, font: &str);

    fn fill_rect(&mut self, x: f64, y: f64, width: f64, height: f64);
    fn begin_path(&mut self);
    fn move_to(&mut self, x: f64, y: f64);
    fn line_to(&mut self, x: f64, y: f64);
    fn close_path(&mut self);
    fn stroke(&mut self);

    fn save(&mut self);
    fn restore(&mut self);
    fn translate(&mut self, x: f64, y: f64);
    fn rotate(&mut self, angle: f64);

    fn fill_text(&mut self, text: &str, x: f64, y: f64);
    fn measure_text(&self, text: &str) -> f64;
}

pub type SharedSurface = Rc<RefCell<dyn Surface>>;

/// Drawing calls for a binary module, under `namespace`.
///
/// Coordinates and angles are `f64`; `fill_style` and `stroke_style` take a
/// packed `0xRRGGBB` colour. Text calls need strings and stay with the glue
/// module.
pub fn surface_imports(namespace: &str, surface: SharedSurface) -> ImportTable {
    let mut table = ImportTable::new();
    let mut bind = |symbol: &'static str, call: fn(&mut dyn Surface, &[Val]) -> Result<Vec<Val>>| {
        let surface = surface.clone();
        table.define(
            namespace,
            symbol,
            host_func(move |args| {
                let mut surface = surface
                    .try_borrow_mut()
                    .map_err(|_| anyhow::anyhow!("surface is busy during {}", symbol))?;
                call(&mut *surface, args).map_err(|err| err.context(symbol))
            }),
        );
    };

    bind("width", |s, args| {
        numbers::<0>(args)?;
        Ok(vec![Val::F64(s.width())])
    });
    bind("height", |s, args| {
        numbers::<0>(args)?;
        Ok(vec![Val::F64(s.height())])
    });
    bind("fill_style", |s, args| {
        s.set_fill_style(&colour(args)?);
        Ok(vec![])
    });
    bind("stroke_style", |s, args| {
        s.set_stroke_style(&colour(args)?);
        Ok(vec![])
    });
    bind("fill_rect", |s, args| {
        let [x, y, w, h] = numbers::<4>(args)?;
        s.fill_rect(x, y, w, h);
        Ok(vec![])
    });
    bind("begin_path", |s, args| {
        numbers::<0>(args)?;
        s.begin_path();
        Ok(vec![])
    });
    bind("move_to", |s, args| {
        let [x, y] = numbers::<2>(args)?;
        s.move_to(x, y);
        Ok(vec![])
    });
    bind("line_to", |s, args| {
        let [x, y] = numbers::<2>(args)?;
        s.line_to(x, y);
        Ok(vec![])
    });
    bind("close_path", |s, args| {
        numbers::<0>(args)?;
        s.close_path();
        Ok(vec![])
    });
    bind("stroke", |s, args| {
        numbers::<0>(args)?;
        s.stroke();
        Ok(vec![])
    });
    bind("save", |s, args| {
        numbers::<0>(args)?;
        s.save();
        Ok(vec![])
    });
    bind("restore", |s, args| {
        numbers::<0>(args)?;
        s.restore();
        Ok(vec![])
    });
    bind("translate", |s, args| {
        let [x, y] = numbers::<2>(args)?;
        s.translate(x, y);
        Ok(vec![])
    });
    bind("rotate", |s, args| {
        let [angle] = numbers::<1>(args)?;
        s.rotate(angle);
        Ok(vec![])
    });
    table
}

/// `input_state() -> i32` returning [`InputState::bits`], under `namespace`.
pub fn input_imports(namespace: &str, input: Rc<Cell<InputState>>) -> ImportTable {
    ImportTable::new().with(
        namespace,
        "input_state",
        host_func(move |args| {
            numbers::<0>(args)?;
            Ok(vec![Val::I32(input.get().bits())])
        }),
    )
}

fn numbers<const N: usize>(args: &[Val]) -> Result<[f64; N]> {
    if args.len() != N {
        bail!("expected {} arguments, got {}", N, args.len());
    }
    let mut out = [0.0; N];
    for (slot, arg) in out.iter_mut().zip(args) {
        *slot = match *arg {
            Val::I32(v) => f64::from(v),
            Val::I64(_) => bail!("expected a 32-bit or float argument, got {:?}", arg),
            Val::F32(v) => f64::from(v),
            Val::F64(v) => v,
        };
    }
    Ok(out)
}

fn colour(args: &[Val]) -> Result<String> {
    match args {
        [Val::I32(rgb)] => Ok(format!("#{:06x}", rgb & 0x00ff_ffff)),
        _ => bail!("expected one packed 0xRRGGBB colour, got {:?}", args),
    }
}

/// Fixed-period trigger for the program's update/render step.
#[derive(Clone, Copy, Debug)]
pub struct TickDriver {
    period: Duration,
}

impl Default for TickDriver {
    fn default() -> Self {
        Self::new(DEFAULT_TICK_PERIOD)
    }
}

impl TickDriver {
    pub fn new(period: Duration) -> Self {
        Self { period }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Call `tick` once per period, the first time one period from now.
    /// Stops after `ticks` calls when given, or at the first error.
    pub async fn run<F>(&self, ticks: Option<u64>, mut tick: F) -> Result<u64>
    where
        F: FnMut(u64) -> Result<()>,
    {
        let mut interval = interval_at(Instant::now() + self.period, self.period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut count = 0;
        while ticks.map_or(true, |limit| count < limit) {
            interval.tick().await;
            tick(count)?;
            count += 1;
        }
        tracing::debug!(ticks = count, "tick driver stopped");
        Ok(count)
    }
}
