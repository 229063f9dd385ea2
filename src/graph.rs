#![cfg(not(tarpaulin_include))]

use crate::error::{DashError, Result};
use chrono::NaiveDate;
use plotters::chart::SeriesAnno;
use plotters::coord::cartesian::Cartesian2d;
use plotters::coord::types::RangedCoordf64;
use plotters::data::Quartiles;
use plotters::prelude::*;
use std::collections::HashMap;
use std::io::Cursor;

/// An RGB colour used by figure traces
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rgb(pub u8, pub u8, pub u8);

impl Rgb {
    pub const RED: Rgb = Rgb(255, 0, 0);
    pub const BLUE: Rgb = Rgb(0, 0, 255);
    pub const BLACK: Rgb = Rgb(0, 0, 0);
    pub const GRAY: Rgb = Rgb(128, 128, 128);

    fn to_plotters(self) -> RGBColor {
        RGBColor(self.0, self.1, self.2)
    }
}

/// Default trace colours, cycled in category order
pub const PALETTE: [Rgb; 10] = [
    Rgb(0x63, 0x6e, 0xfa),
    Rgb(0xef, 0x55, 0x3b),
    Rgb(0x00, 0xcc, 0x96),
    Rgb(0xab, 0x63, 0xfa),
    Rgb(0xff, 0xa1, 0x5a),
    Rgb(0x19, 0xd3, 0xf3),
    Rgb(0xff, 0x66, 0x92),
    Rgb(0xb6, 0xe8, 0x80),
    Rgb(0xff, 0x97, 0xff),
    Rgb(0xfe, 0xcb, 0x52),
];

/// How a trace is drawn
#[derive(Debug, Clone, PartialEq)]
pub enum TraceKind {
    /// Unconnected markers
    Markers,

    /// A box-and-whisker summary of `y`, drawn at `x[0]`
    Box {
        /// Draw the mean as a dashed line across the box
        show_mean: bool,
    },

    /// A connected line with a marker at every point
    LinesMarkers,
}

/// One data series of a figure
#[derive(Debug, Clone, PartialEq)]
pub struct Trace {
    /// Legend entry; empty for uncategorised data
    pub name: String,
    pub kind: TraceKind,
    pub x: Vec<f64>,
    pub y: Vec<f64>,
    pub marker: Rgb,
    pub line: Rgb,
    pub marker_size: u32,
}

/// A text label placed in data coordinates
#[derive(Debug, Clone, PartialEq)]
pub struct Annotation {
    pub x: f64,
    pub y: f64,
    pub text: String,
}

/// How x-axis tick values are labelled
#[derive(Debug, Clone, PartialEq)]
pub enum XAxis {
    /// Plain numbers
    Linear,

    /// Integer positions named by category
    Categories(Vec<String>),

    /// Day offsets from the given origin date
    Days(NaiveDate),
}

/// Everything needed to draw a chart
///
/// Builders in this module only produce `Figure` values; turning them into
/// pixels is [`render_png`]'s job. This keeps the layout rules (ranges,
/// annotations, colours) testable without a font or a bitmap.
#[derive(Debug, Clone, PartialEq)]
pub struct Figure {
    pub title: String,
    pub x_title: String,
    pub y_title: String,
    pub width: u32,
    pub height: u32,
    pub x_range: (f64, f64),
    pub y_range: (f64, f64),
    pub x_axis: XAxis,
    pub traces: Vec<Trace>,
    pub annotations: Vec<Annotation>,
}

/// Group values by category, keeping first-seen category order
///
/// `None` puts every value into a single unnamed group.
fn group<'a, T: Copy>(values: &[T], category: Option<&[&'a str]>) -> Vec<(&'a str, Vec<T>)> {
    let Some(category) = category else {
        return vec![("", values.to_vec())];
    };

    let mut groups: Vec<(&'a str, Vec<T>)> = Vec::new();
    for (v, c) in values.iter().zip(category) {
        match groups.iter_mut().find(|(name, _)| name == c) {
            Some((_, members)) => members.push(*v),
            None => groups.push((*c, vec![*v])),
        }
    }
    groups
}

fn check_lengths(what: &str, len: usize, others: &[usize]) -> Result<()> {
    if len == 0 {
        return Err(DashError::Chart(format!("{}: no data to plot", what)));
    }
    if others.iter().any(|&n| n != len) {
        return Err(DashError::Chart(format!(
            "{}: input arrays have different lengths",
            what
        )));
    }
    Ok(())
}

fn min_max(values: &[f64]) -> (f64, f64) {
    values
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| {
            (lo.min(v), hi.max(v))
        })
}

/// Pad a range by 10% of each extreme's magnitude
fn padded(lo: f64, hi: f64) -> (f64, f64) {
    let (lo, hi) = (lo - lo.abs() * 0.1, hi + hi.abs() * 0.1);
    if lo == hi { (lo - 1.0, hi + 1.0) } else { (lo, hi) }
}

/// Scatter plot with one marker trace per category
///
/// Categories keep their first-seen order. A category found in `colors`
/// uses that colour, the rest cycle through [`PALETTE`]. Both axis ranges
/// are the data extremes widened by one unit.
///
/// # Arguments
/// * `x`, `y` - Point coordinates, same length
/// * `category` - Optional category per point; `None` gives a single trace
/// * `colors` - Optional fixed colour per category name
/// * `x_title`, `y_title` - Axis titles
///
/// # Returns
/// * A 700x500 figure
///
/// # Errors
/// * `DashError::Chart` when inputs are empty or their lengths differ
pub fn scatter_plot(
    x: &[f64],
    y: &[f64],
    category: Option<&[&str]>,
    colors: Option<&HashMap<String, Rgb>>,
    x_title: &str,
    y_title: &str,
) -> Result<Figure> {
    let cat_len = category.map_or(x.len(), |c| c.len());
    check_lengths("scatter plot", x.len(), &[y.len(), cat_len])?;

    let points = x.iter().copied().zip(y.iter().copied()).collect::<Vec<_>>();
    let traces = group(&points, category)
        .into_iter()
        .enumerate()
        .map(|(i, (name, pts))| {
            let color = colors
                .and_then(|m| m.get(name))
                .copied()
                .unwrap_or(PALETTE[i % PALETTE.len()]);
            Trace {
                name: name.to_string(),
                kind: TraceKind::Markers,
                x: pts.iter().map(|p| p.0).collect(),
                y: pts.iter().map(|p| p.1).collect(),
                marker: color,
                line: color,
                marker_size: 5,
            }
        })
        .collect();

    let (x_lo, x_hi) = min_max(x);
    let (y_lo, y_hi) = min_max(y);

    Ok(Figure {
        title: String::new(),
        x_title: x_title.to_string(),
        y_title: y_title.to_string(),
        width: 700,
        height: 500,
        x_range: (x_lo - 1.0, x_hi + 1.0),
        y_range: (y_lo - 1.0, y_hi + 1.0),
        x_axis: XAxis::Linear,
        traces,
        annotations: Vec::new(),
    })
}

struct BoxStyle {
    width: u32,
    height: u32,
    marker: Rgb,
    line: Rgb,
    /// Annotation height as a multiple of the box maximum when uncategorised
    single_offset: f64,
}

fn boxes(data: &[f64], category: Option<&[&str]>, style: BoxStyle) -> Result<Figure> {
    let cat_len = category.map_or(data.len(), |c| c.len());
    check_lengths("box plot", data.len(), &[cat_len])?;

    let groups = group(data, category);
    let mut traces = Vec::with_capacity(groups.len());
    let mut annotations = Vec::with_capacity(groups.len());

    for (i, (name, values)) in groups.iter().enumerate() {
        let pos = i as f64;
        let (_, hi) = min_max(values);
        let factor = if category.is_some() { 1.03 } else { style.single_offset };

        annotations.push(Annotation {
            x: pos,
            y: hi * factor,
            text: format!("N={}", values.len()),
        });
        traces.push(Trace {
            name: name.to_string(),
            kind: TraceKind::Box { show_mean: true },
            x: vec![pos; values.len()],
            y: values.clone(),
            marker: style.marker,
            line: style.line,
            marker_size: 4,
        });
    }

    let (lo, hi) = min_max(data);
    Ok(Figure {
        title: String::new(),
        x_title: String::new(),
        y_title: String::new(),
        width: style.width,
        height: style.height,
        x_range: (-0.5, groups.len() as f64 - 0.5),
        y_range: padded(lo, hi),
        x_axis: XAxis::Categories(groups.iter().map(|(n, _)| n.to_string()).collect()),
        traces,
        annotations,
    })
}

/// Box plot with one box per category and an `N=` count above each box
///
/// Each box shows its mean. Counts sit at 1.03 times the box maximum, or
/// 1.05 times when there is no category and only a single box. The y range
/// is padded by 10% of the data extremes.
///
/// # Arguments
/// * `data` - Values to summarise
/// * `category` - Optional category per value, same length as `data`
/// * `x_title`, `y_title` - Axis titles
///
/// # Returns
/// * A 1200x500 figure, or `DashError::Chart` for empty or mismatched input
///
/// # Examples
/// ```
/// use dashboard::graph::box_plot;
///
/// let fig = box_plot(&[1.0, 2.0, 3.0], Some(&["a", "b", "a"][..]), "product", "score").unwrap();
/// assert_eq!(fig.traces.len(), 2);
/// assert_eq!(fig.annotations[0].text, "N=2");
/// ```
pub fn box_plot(
    data: &[f64],
    category: Option<&[&str]>,
    x_title: &str,
    y_title: &str,
) -> Result<Figure> {
    let mut fig = boxes(
        data,
        category,
        BoxStyle {
            width: 1200,
            height: 500,
            marker: PALETTE[0],
            line: PALETTE[0],
            single_offset: 1.05,
        },
    )?;
    fig.x_title = x_title.to_string();
    fig.y_title = y_title.to_string();
    Ok(fig)
}

/// Compact box plot with counts: red points and black outlines, blue when
/// uncategorised
///
/// # Arguments
/// * `data` - Values to summarise
/// * `category` - Optional category per value; the x title is `Category`
///   when given and empty otherwise
/// * `title` - Chart title
///
/// # Returns
/// * A 700x500 figure with `N=` annotations at 1.03 times each box maximum
pub fn box_plot_with_count(data: &[f64], category: Option<&[&str]>, title: &str) -> Result<Figure> {
    let (marker, line) = match category {
        Some(_) => (Rgb::RED, Rgb::BLACK),
        None => (Rgb::BLUE, Rgb::BLUE),
    };
    let mut fig = boxes(
        data,
        category,
        BoxStyle {
            width: 700,
            height: 500,
            marker,
            line,
            single_offset: 1.03,
        },
    )?;
    fig.title = title.to_string();
    fig.x_title = if category.is_some() { "Category".to_string() } else { String::new() };
    Ok(fig)
}

/// Line chart of values over dates
///
/// Dates are stored as day offsets from the earliest date so the renderer
/// can label ticks with calendar dates. Input order does not matter.
///
/// # Arguments
/// * `dates`, `values` - One value per date, same length
/// * `title`, `x_title`, `y_title` - Chart and axis titles
///
/// # Returns
/// * A figure with one blue line trace and red markers of size 6
pub fn trend_plot(
    dates: &[NaiveDate],
    values: &[f64],
    title: &str,
    x_title: &str,
    y_title: &str,
) -> Result<Figure> {
    check_lengths("trend plot", dates.len(), &[values.len()])?;

    let mut points = dates.iter().copied().zip(values.iter().copied()).collect::<Vec<_>>();
    points.sort_by_key(|p| p.0);
    let origin = points[0].0;

    let x = points
        .iter()
        .map(|(d, _)| (*d - origin).num_days() as f64)
        .collect::<Vec<_>>();
    let y = points.iter().map(|p| p.1).collect::<Vec<_>>();

    let (x_lo, x_hi) = min_max(&x);
    let (y_lo, y_hi) = min_max(&y);
    let y_pad = if y_hi > y_lo { (y_hi - y_lo) * 0.05 } else { 1.0 };

    Ok(Figure {
        title: title.to_string(),
        x_title: x_title.to_string(),
        y_title: y_title.to_string(),
        width: 900,
        height: 450,
        x_range: if x_hi > x_lo { (x_lo, x_hi) } else { (x_lo - 1.0, x_hi + 1.0) },
        y_range: (y_lo - y_pad, y_hi + y_pad),
        x_axis: XAxis::Days(origin),
        traces: vec![Trace {
            name: String::new(),
            kind: TraceKind::LinesMarkers,
            x,
            y,
            marker: Rgb::RED,
            line: Rgb::BLUE,
            marker_size: 6,
        }],
        annotations: Vec::new(),
    })
}

/// Render a figure to PNG bytes
///
/// Drawing happens in an in-memory RGB buffer which is then PNG-encoded;
/// nothing touches the filesystem.
///
/// # Errors
/// * `DashError::Chart` if drawing (for example font lookup) or encoding fails
pub fn render_png(fig: &Figure) -> Result<Vec<u8>> {
    let (w, h) = (fig.width, fig.height);
    let mut buffer = vec![0u8; (w as usize) * (h as usize) * 3];

    {
        let root = BitMapBackend::with_buffer(&mut buffer, (w, h)).into_drawing_area();
        draw_figure(fig, &root).map_err(|e| DashError::Chart(e.to_string()))?;
    }

    let img = image::RgbImage::from_raw(w, h, buffer)
        .ok_or_else(|| DashError::Chart("bitmap buffer has the wrong size".to_string()))?;
    let mut out = Cursor::new(Vec::new());
    image::DynamicImage::ImageRgb8(img)
        .write_to(&mut out, image::ImageOutputFormat::Png)
        .map_err(|e| DashError::Chart(e.to_string()))?;

    Ok(out.into_inner())
}

fn draw_figure(
    fig: &Figure,
    root: &DrawingArea<BitMapBackend<'_>, plotters::coord::Shift>,
) -> std::result::Result<(), Box<dyn std::error::Error>> {
    root.fill(&WHITE)?;

    let mut chart = ChartBuilder::on(root)
        .caption(&fig.title, ("sans-serif", 22).into_font())
        .margin(15)
        .x_label_area_size(40)
        .y_label_area_size(60)
        .build_cartesian_2d(fig.x_range.0..fig.x_range.1, fig.y_range.0..fig.y_range.1)?;

    let formatter: Box<dyn Fn(&f64) -> String> = match &fig.x_axis {
        XAxis::Linear => Box::new(|v: &f64| format!("{}", v)),
        XAxis::Categories(names) => {
            let names = names.clone();
            Box::new(move |v: &f64| {
                let idx = v.round();
                if (v - idx).abs() > 1e-6 || idx < 0.0 {
                    return String::new();
                }
                names.get(idx as usize).cloned().unwrap_or_default()
            })
        }
        XAxis::Days(origin) => {
            let origin = *origin;
            Box::new(move |v: &f64| {
                (origin + chrono::Duration::days(v.round() as i64))
                    .format("%Y-%m-%d")
                    .to_string()
            })
        }
    };
    let x_labels = match &fig.x_axis {
        XAxis::Categories(names) => names.len() + 1,
        _ => 8,
    };

    chart
        .configure_mesh()
        .x_desc(&fig.x_title)
        .y_desc(&fig.y_title)
        .x_labels(x_labels)
        .x_label_formatter(&*formatter)
        .draw()?;

    for trace in &fig.traces {
        let marker = trace.marker.to_plotters();
        let line = trace.line.to_plotters();
        let size = trace.marker_size;
        let points = trace.x.iter().copied().zip(trace.y.iter().copied());

        let anno = match trace.kind {
            TraceKind::Markers => chart.draw_series(
                points.map(|p| Circle::new(p, size, marker.filled())),
            )?,
            TraceKind::LinesMarkers => {
                chart.draw_series(LineSeries::new(points.clone(), line.stroke_width(2)))?;
                chart.draw_series(points.map(|p| Circle::new(p, size, marker.filled())))?
            }
            TraceKind::Box { show_mean } => draw_box(&mut chart, trace, show_mean)?,
        };

        if !trace.name.is_empty() && fig.traces.len() > 1 {
            anno.label(trace.name.clone())
                .legend(move |(x, y)| Circle::new((x, y), 4, marker.filled()));
        }
    }

    for a in &fig.annotations {
        chart.draw_series(std::iter::once(Text::new(
            a.text.clone(),
            (a.x, a.y),
            ("sans-serif", 14).into_font(),
        )))?;
    }

    if fig.traces.iter().filter(|t| !t.name.is_empty()).count() > 1 {
        chart
            .configure_series_labels()
            .background_style(&WHITE.mix(0.8))
            .border_style(&BLACK)
            .draw()?;
    }

    root.present()?;
    Ok(())
}

type Chart<'a, 'b> = ChartContext<'a, BitMapBackend<'b>, Cartesian2d<RangedCoordf64, RangedCoordf64>>;

fn draw_box<'c, 'a, 'b>(
    chart: &'c mut Chart<'a, 'b>,
    trace: &Trace,
    show_mean: bool,
) -> std::result::Result<
    &'c mut SeriesAnno<'a, BitMapBackend<'b>>,
    Box<dyn std::error::Error>,
> {
    let x = trace.x.first().copied().unwrap_or(0.0);
    let marker = trace.marker.to_plotters();
    let line = trace.line.to_plotters();
    let half = 0.3;

    let q = Quartiles::new(&trace.y);
    let [lower_fence, q1, median, q3, upper_fence] = q.values().map(f64::from);

    // whiskers stop at the furthest points inside the fences
    let inside = trace.y.iter().copied().filter(|v| *v >= lower_fence && *v <= upper_fence);
    let (lo, hi) = min_max(&inside.collect::<Vec<_>>());
    let (lo, hi) = if lo.is_finite() { (lo, hi) } else { (q1, q3) };

    let stroke = line.stroke_width(2);
    chart.draw_series(std::iter::once(Rectangle::new(
        [(x - half, q1), (x + half, q3)],
        stroke,
    )))?;
    chart.draw_series(
        [
            vec![(x - half, median), (x + half, median)],
            vec![(x, q3), (x, hi)],
            vec![(x, q1), (x, lo)],
            vec![(x - half / 2.0, hi), (x + half / 2.0, hi)],
            vec![(x - half / 2.0, lo), (x + half / 2.0, lo)],
        ]
        .into_iter()
        .map(|pts| PathElement::new(pts, stroke)),
    )?;

    if show_mean && !trace.y.is_empty() {
        let mean = trace.y.iter().sum::<f64>() / trace.y.len() as f64;
        let dashes = (0..6).map(|i| {
            let start = x - half + i as f64 * (2.0 * half / 6.0);
            PathElement::new(vec![(start, mean), (start + half / 6.0, mean)], line.stroke_width(1))
        });
        chart.draw_series(dashes)?;
    }

    let outliers = trace
        .y
        .iter()
        .copied()
        .filter(|v| *v < lo || *v > hi)
        .map(|v| Circle::new((x, v), trace.marker_size, marker.filled()))
        .collect::<Vec<_>>();
    Ok(chart.draw_series(outliers)?)
}
