use anyhow::{anyhow, Result};
use clap::Parser;
use log::{debug, info, warn};
use rustc_hash::{FxHashMap, FxHashSet};
use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "hivlook")]
#[command(about = "Render an HIV-1 genome map with subtype recombination overlays.", long_about = None)]
struct Args {
    // MANDATORY OPTIONS
    /// Load subtype region annotations from this FILE.
    #[arg(short = 'i', long = "input", value_name = "FILE")]
    input: PathBuf,

    // Output Options
    /// Write a 300 dpi raster rendering to this FILE.
    #[arg(long = "png", value_name = "FILE")]
    png: Option<PathBuf>,

    /// Write a single-page vector rendering to this FILE.
    #[arg(long = "pdf", value_name = "FILE")]
    pdf: Option<PathBuf>,

    /// Write the figure as SVG markup to this FILE.
    #[arg(long = "svg", value_name = "FILE")]
    svg: Option<PathBuf>,

    // Logging Options
    /// Verbosity level (0 = errors only, 1 = info, 2 = debug).
    #[arg(short = 'v', long = "verbose", value_name = "N", default_value_t = 1)]
    verbose: u8,
}

/// Default display colors for the named HIV-1 subtypes and common CRFs
const SUBTYPE_COLORS: [(&str, &str); 17] = [
    ("A", "#E6550D"),
    ("A1", "#FD8D3C"),
    ("A2", "#FDBE85"),
    ("B", "#3F98F2"),
    ("C", "#31A354"),
    ("D", "#756BB1"),
    ("F", "#E377C2"),
    ("F1", "#C51B8A"),
    ("F2", "#FA9FB5"),
    ("G", "#FFD92F"),
    ("H", "#8C564B"),
    ("J", "#17BECF"),
    ("K", "#BCBD22"),
    ("CRF01_AE", "#9E9AC8"),
    ("CRF02_AG", "#A63603"),
    ("O", "#636363"),
    ("U", "#969696"), // unclassified fragments
];

/// ColorBrewer Dark2 qualitative palette extended to 10 entries,
/// cycled for subtype labels without a default color
const FALLBACK_PALETTE: [&str; 10] = [
    "#1B9E77",
    "#D95F02",
    "#7570B3",
    "#E7298A",
    "#66A61E",
    "#E6AB02",
    "#A6761D",
    "#666666",
    "#1F78B4",
    "#B2DF8A",
];

/// Session-scoped assignment of display colors to subtype labels
struct ColorRegistry {
    assigned: FxHashMap<String, &'static str>,
    next_fallback: usize,
}

impl ColorRegistry {
    fn new() -> Self {
        let assigned = SUBTYPE_COLORS
            .iter()
            .map(|&(label, color)| (label.to_string(), color))
            .collect();
        ColorRegistry {
            assigned,
            next_fallback: 0,
        }
    }

    /// Color for a subtype label. Known labels keep their color across
    /// calls; new labels take the next fallback color, wrapping after the
    /// palette is exhausted.
    fn color_for(&mut self, label: &str) -> &'static str {
        if let Some(&color) = self.assigned.get(label) {
            return color;
        }
        let color = FALLBACK_PALETTE[self.next_fallback % FALLBACK_PALETTE.len()];
        self.next_fallback += 1;
        self.assigned.insert(label.to_string(), color);
        color
    }
}

/// A fixed annotation rectangle on one of the three gene rows
struct GeneFeature {
    name: &'static str,
    start: i64,
    end: i64,
    row: u8,
    fill: &'static str,
    outlined: bool,
}

/// HXB2 (K03455) gene map on three display rows. The unnamed entries are
/// the tat/rev splice exons; their labels come from the connectors.
const GENE_MAP: [GeneFeature; 13] = [
    GeneFeature { name: "5' LTR", start: 1, end: 634, row: 1, fill: "#D9D9D9", outlined: true },
    GeneFeature { name: "gag", start: 790, end: 2292, row: 1, fill: "#F6C494", outlined: false },
    GeneFeature { name: "vif", start: 5041, end: 5619, row: 1, fill: "#C9E4A5", outlined: false },
    GeneFeature { name: "", start: 5831, end: 6045, row: 1, fill: "#F7E8A4", outlined: false },
    GeneFeature { name: "vpu", start: 6062, end: 6310, row: 1, fill: "#B8E8E0", outlined: false },
    GeneFeature { name: "", start: 8379, end: 8653, row: 1, fill: "#CBB9E8", outlined: false },
    GeneFeature { name: "3' LTR", start: 9086, end: 9719, row: 1, fill: "#D9D9D9", outlined: true },
    GeneFeature { name: "pol", start: 2085, end: 5096, row: 2, fill: "#A8D3F0", outlined: false },
    GeneFeature { name: "vpr", start: 5559, end: 5850, row: 2, fill: "#F2B5D4", outlined: false },
    GeneFeature { name: "", start: 5970, end: 6045, row: 2, fill: "#CBB9E8", outlined: false },
    GeneFeature { name: "", start: 8379, end: 8469, row: 2, fill: "#F7E8A4", outlined: false },
    GeneFeature { name: "nef", start: 8797, end: 9417, row: 2, fill: "#D4C9A8", outlined: false },
    GeneFeature { name: "env", start: 6225, end: 8795, row: 3, fill: "#F4A8A8", outlined: false },
];

/// Spliced transcript connectors: (label, donor position, donor row,
/// acceptor position, acceptor row, fraction of the row gap for the
/// horizontal run)
const CONNECTORS: [(&str, i64, u8, i64, u8, f64); 2] = [
    ("tat", 6045, 1, 8379, 2, 0.25),
    ("rev", 6045, 2, 8379, 1, 0.75),
];

/// A user-supplied genomic interval tagged with a subtype label
#[derive(Debug, Clone)]
struct SubtypeRegion {
    start: i64,
    end: i64,
    label: String,
    color: &'static str,
}

/// Outcome of one parse over the annotation text
#[derive(Debug)]
struct ParsedAnnotations {
    regions: Vec<SubtypeRegion>,
    header_seen: bool,
}

/// Parse annotation text into subtype regions.
///
/// Lines starting with '#' are comments and blank lines are skipped
/// anywhere. Data lines are only read after a '>' header line and carry
/// two integer positions (in either order) followed by a free-text
/// subtype label.
fn parse_annotations(text: &str, registry: &mut ColorRegistry) -> ParsedAnnotations {
    let mut regions = Vec::new();
    let mut header_seen = false;

    for (idx, line) in text.lines().enumerate() {
        let line_no = idx + 1;

        if line.trim().is_empty() {
            continue;
        }
        if line.starts_with('#') {
            continue;
        }
        if line.starts_with('>') {
            debug!("line {}: header {:?}", line_no, line);
            header_seen = true;
            continue;
        }
        if !header_seen {
            continue;
        }

        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 3 {
            warn!(
                "line {}: expected two positions and a subtype label, got {} fields",
                line_no,
                fields.len()
            );
            continue;
        }
        let (Ok(a), Ok(b)) = (fields[0].parse::<i64>(), fields[1].parse::<i64>()) else {
            continue;
        };
        let label = fields[2..].join(" ");
        if label.is_empty() {
            continue;
        }
        let color = registry.color_for(&label);
        let (start, end) = (a.min(b), a.max(b));
        debug!("line {}: region {}..{} ({})", line_no, start, end, label);
        regions.push(SubtypeRegion {
            start,
            end,
            label,
            color,
        });
    }

    if !header_seen {
        warn!("no '>' header line found, no regions parsed");
    }

    ParsedAnnotations {
        regions,
        header_seen,
    }
}

/// Linear genomic position to pixel x mapping
#[derive(Debug, Clone, Copy)]
struct Scale {
    domain: (f64, f64),
    range: (f64, f64),
}

impl Scale {
    /// Positions outside the domain extrapolate past the canvas edges.
    fn x(&self, pos: f64) -> f64 {
        self.range.0
            + (pos - self.domain.0) / (self.domain.1 - self.domain.0)
                * (self.range.1 - self.range.0)
    }
}

/// Fixed canvas geometry and genomic domain
#[derive(Debug, Clone)]
struct RenderConfig {
    width: f64,
    height: f64,
    x_margin: f64,
    row_top: f64,
    row_height: f64,
    row_gap: f64,
    axis_y: f64,
    legend_y: f64,
    legend_step: f64,
    domain: (f64, f64),
}

impl Default for RenderConfig {
    fn default() -> Self {
        RenderConfig {
            width: 900.0,
            height: 300.0,
            x_margin: 40.0,
            row_top: 70.0,
            row_height: 26.0,
            row_gap: 16.0,
            axis_y: 220.0,
            legend_y: 255.0,
            legend_step: 90.0,
            domain: (0.0, 9719.0),
        }
    }
}

impl RenderConfig {
    fn scale(&self) -> Scale {
        Scale {
            domain: self.domain,
            range: (self.x_margin, self.width - self.x_margin),
        }
    }

    /// Top edge of a gene row (rows are numbered 1..=3)
    fn row_y(&self, row: u8) -> f64 {
        self.row_top + (row as f64 - 1.0) * (self.row_height + self.row_gap)
    }
}

/// An annotated boundary of the overall region span
#[derive(Debug, Clone)]
struct Breakpoint {
    position: i64,
    display_value: i64,
    is_first: bool,
    is_last: bool,
}

/// Breakpoints of the overall span: the first start and, with more than
/// one region, the last end after a stable sort by start. Inner region
/// boundaries are not surfaced.
fn breakpoints(regions: &[SubtypeRegion]) -> Vec<Breakpoint> {
    if regions.is_empty() {
        return Vec::new();
    }

    let mut sorted: Vec<&SubtypeRegion> = regions.iter().collect();
    sorted.sort_by_key(|r| r.start);

    let first = sorted[0];
    let mut out = vec![Breakpoint {
        position: first.start,
        display_value: first.start,
        is_first: true,
        is_last: false,
    }];
    if sorted.len() > 1 {
        let last = sorted[sorted.len() - 1];
        out.push(Breakpoint {
            position: last.end,
            display_value: last.end,
            is_first: false,
            is_last: true,
        });
    }
    out
}

/// Immediate-mode drawing operations shared by all output backends.
/// Text is anchored at the left end of its baseline; callers center text
/// themselves from the monospace advance estimate so every backend
/// places glyph boxes at identical coordinates.
trait Surface {
    fn fill_rect(&mut self, x: f64, y: f64, w: f64, h: f64, color: &str);
    /// `under` is the fill the rectangle paints over, for backends
    /// without native transparency.
    fn fill_rect_alpha(&mut self, x: f64, y: f64, w: f64, h: f64, color: &str, alpha: f64, under: &str);
    fn stroke_rect(&mut self, x: f64, y: f64, w: f64, h: f64, color: &str, width: f64);
    fn line(&mut self, x1: f64, y1: f64, x2: f64, y2: f64, color: &str, width: f64);
    fn polyline(&mut self, points: &[(f64, f64)], color: &str, width: f64);
    fn text(&mut self, x: f64, y: f64, s: &str, size: f64, color: &str);
    /// Text rotated 90 degrees, reading bottom to top, baseline through
    /// the anchor point.
    fn rotated_text(&mut self, x: f64, y: f64, s: &str, size: f64, color: &str);
}

/// Escape special XML characters
fn escape_xml(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

/// Drawing surface emitting SVG elements into a string buffer
struct SvgSurface {
    svg: String,
}

impl SvgSurface {
    fn new(width: f64, height: f64) -> Self {
        let mut svg = String::new();
        svg.push_str(&format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<svg xmlns="http://www.w3.org/2000/svg" width="{}" height="{}" viewBox="0 0 {} {}">
<style>
  .label {{ font-family: 'DejaVu Sans Mono', 'Courier New', monospace; }}
</style>
"#,
            width, height, width, height
        ));
        SvgSurface { svg }
    }

    fn finish(mut self) -> String {
        self.svg.push_str("</svg>\n");
        self.svg
    }
}

impl Surface for SvgSurface {
    fn fill_rect(&mut self, x: f64, y: f64, w: f64, h: f64, color: &str) {
        self.svg.push_str(&format!(
            r#"<rect x="{:.1}" y="{:.1}" width="{:.1}" height="{:.1}" fill="{}"/>"#,
            x, y, w, h, color
        ));
        self.svg.push('\n');
    }

    fn fill_rect_alpha(&mut self, x: f64, y: f64, w: f64, h: f64, color: &str, alpha: f64, _under: &str) {
        self.svg.push_str(&format!(
            r#"<rect x="{:.1}" y="{:.1}" width="{:.1}" height="{:.1}" fill="{}" fill-opacity="{}"/>"#,
            x, y, w, h, color, alpha
        ));
        self.svg.push('\n');
    }

    fn stroke_rect(&mut self, x: f64, y: f64, w: f64, h: f64, color: &str, width: f64) {
        self.svg.push_str(&format!(
            r#"<rect x="{:.1}" y="{:.1}" width="{:.1}" height="{:.1}" fill="none" stroke="{}" stroke-width="{}"/>"#,
            x, y, w, h, color, width
        ));
        self.svg.push('\n');
    }

    fn line(&mut self, x1: f64, y1: f64, x2: f64, y2: f64, color: &str, width: f64) {
        self.svg.push_str(&format!(
            r#"<line x1="{:.1}" y1="{:.1}" x2="{:.1}" y2="{:.1}" stroke="{}" stroke-width="{}"/>"#,
            x1, y1, x2, y2, color, width
        ));
        self.svg.push('\n');
    }

    fn polyline(&mut self, points: &[(f64, f64)], color: &str, width: f64) {
        let mut d = String::new();
        for (i, &(x, y)) in points.iter().enumerate() {
            if i == 0 {
                d.push_str(&format!("M{:.1},{:.1}", x, y));
            } else {
                d.push_str(&format!(" L{:.1},{:.1}", x, y));
            }
        }
        self.svg.push_str(&format!(
            r#"<path d="{}" fill="none" stroke="{}" stroke-width="{}"/>"#,
            d, color, width
        ));
        self.svg.push('\n');
    }

    fn text(&mut self, x: f64, y: f64, s: &str, size: f64, color: &str) {
        self.svg.push_str(&format!(
            r#"<text x="{:.1}" y="{:.1}" class="label" font-size="{}px" fill="{}">{}</text>"#,
            x,
            y,
            size,
            color,
            escape_xml(s)
        ));
        self.svg.push('\n');
    }

    fn rotated_text(&mut self, x: f64, y: f64, s: &str, size: f64, color: &str) {
        self.svg.push_str(&format!(
            r#"<text x="{:.1}" y="{:.1}" class="label" font-size="{}px" fill="{}" transform="rotate(-90 {:.1} {:.1})">{}</text>"#,
            x,
            y,
            size,
            color,
            x,
            y,
            escape_xml(s)
        ));
        self.svg.push('\n');
    }
}

const PX_TO_MM: f64 = 0.264583;
const PX_TO_PT: f64 = 0.75;

/// Parse "#RRGGBB" into unit-range RGB components
fn parse_hex_rgb(hex: &str) -> (f64, f64, f64) {
    let n = u32::from_str_radix(hex.strip_prefix('#').unwrap_or(hex), 16).unwrap_or(0);
    (
        ((n >> 16) & 0xFF) as f64 / 255.0,
        ((n >> 8) & 0xFF) as f64 / 255.0,
        (n & 0xFF) as f64 / 255.0,
    )
}

/// Alpha-composite a hex color over an opaque hex background
fn blend_hex(top: &str, alpha: f64, under: &str) -> (f64, f64, f64) {
    let (tr, tg, tb) = parse_hex_rgb(top);
    let (ur, ug, ub) = parse_hex_rgb(under);
    (
        alpha * tr + (1.0 - alpha) * ur,
        alpha * tg + (1.0 - alpha) * ug,
        alpha * tb + (1.0 - alpha) * ub,
    )
}

/// Drawing surface writing onto a single-page PDF document
struct PdfSurface {
    doc: printpdf::PdfDocumentReference,
    page: printpdf::PdfPageIndex,
    layer: printpdf::PdfLayerIndex,
    font: Option<printpdf::IndirectFontRef>,
    height: f64,
}

impl PdfSurface {
    fn new(width: f64, height: f64) -> Self {
        let (doc, page, layer) = printpdf::PdfDocument::new(
            "hivlook",
            printpdf::Mm(width * PX_TO_MM),
            printpdf::Mm(height * PX_TO_MM),
            "Layer 1",
        );
        let font = doc.add_builtin_font(printpdf::BuiltinFont::Courier).ok();
        PdfSurface {
            doc,
            page,
            layer,
            font,
            height,
        }
    }

    fn layer(&self) -> printpdf::PdfLayerReference {
        self.doc.get_page(self.page).get_layer(self.layer)
    }

    fn mm_x(&self, x: f64) -> printpdf::Mm {
        printpdf::Mm(x * PX_TO_MM)
    }

    /// PDF pages have their origin at the bottom left, so y flips here.
    fn mm_y(&self, y: f64) -> printpdf::Mm {
        printpdf::Mm((self.height - y) * PX_TO_MM)
    }

    fn rect_shape(&self, x: f64, y: f64, w: f64, h: f64, fill: bool, stroke: bool) -> printpdf::Line {
        printpdf::Line {
            points: vec![
                (printpdf::Point::new(self.mm_x(x), self.mm_y(y)), false),
                (printpdf::Point::new(self.mm_x(x + w), self.mm_y(y)), false),
                (printpdf::Point::new(self.mm_x(x + w), self.mm_y(y + h)), false),
                (printpdf::Point::new(self.mm_x(x), self.mm_y(y + h)), false),
            ],
            is_closed: true,
            has_fill: fill,
            has_stroke: stroke,
            is_clipping_path: false,
        }
    }

    fn set_fill(&self, color: &str) {
        let (r, g, b) = parse_hex_rgb(color);
        self.layer()
            .set_fill_color(printpdf::Color::Rgb(printpdf::Rgb::new(r, g, b, None)));
    }

    fn set_stroke(&self, color: &str, width: f64) {
        let (r, g, b) = parse_hex_rgb(color);
        let layer = self.layer();
        layer.set_outline_color(printpdf::Color::Rgb(printpdf::Rgb::new(r, g, b, None)));
        layer.set_outline_thickness(width * PX_TO_PT);
    }

    fn write_to_file(self, path: &PathBuf) -> Result<()> {
        let mut out = BufWriter::new(File::create(path)?);
        self.doc.save(&mut out)?;
        Ok(())
    }
}

impl Surface for PdfSurface {
    fn fill_rect(&mut self, x: f64, y: f64, w: f64, h: f64, color: &str) {
        self.set_fill(color);
        self.layer().add_shape(self.rect_shape(x, y, w, h, true, false));
    }

    fn fill_rect_alpha(&mut self, x: f64, y: f64, w: f64, h: f64, color: &str, alpha: f64, under: &str) {
        // printpdf exposes no transparency operators, so composite
        // against the covered fill instead
        let (r, g, b) = blend_hex(color, alpha, under);
        self.layer()
            .set_fill_color(printpdf::Color::Rgb(printpdf::Rgb::new(r, g, b, None)));
        self.layer().add_shape(self.rect_shape(x, y, w, h, true, false));
    }

    fn stroke_rect(&mut self, x: f64, y: f64, w: f64, h: f64, color: &str, width: f64) {
        self.set_stroke(color, width);
        self.layer().add_shape(self.rect_shape(x, y, w, h, false, true));
    }

    fn line(&mut self, x1: f64, y1: f64, x2: f64, y2: f64, color: &str, width: f64) {
        self.set_stroke(color, width);
        self.layer().add_shape(printpdf::Line {
            points: vec![
                (printpdf::Point::new(self.mm_x(x1), self.mm_y(y1)), false),
                (printpdf::Point::new(self.mm_x(x2), self.mm_y(y2)), false),
            ],
            is_closed: false,
            has_fill: false,
            has_stroke: true,
            is_clipping_path: false,
        });
    }

    fn polyline(&mut self, points: &[(f64, f64)], color: &str, width: f64) {
        self.set_stroke(color, width);
        let points = points
            .iter()
            .map(|&(x, y)| (printpdf::Point::new(self.mm_x(x), self.mm_y(y)), false))
            .collect();
        self.layer().add_shape(printpdf::Line {
            points,
            is_closed: false,
            has_fill: false,
            has_stroke: true,
            is_clipping_path: false,
        });
    }

    fn text(&mut self, x: f64, y: f64, s: &str, size: f64, color: &str) {
        let Some(font) = self.font.as_ref() else {
            return;
        };
        self.set_fill(color);
        let layer = self.layer();
        layer.begin_text_section();
        layer.set_font(font, size * PX_TO_PT);
        layer.set_text_cursor(self.mm_x(x), self.mm_y(y));
        layer.set_text_rendering_mode(printpdf::TextRenderingMode::Fill);
        layer.write_text(s, font);
        layer.end_text_section();
    }

    fn rotated_text(&mut self, x: f64, y: f64, s: &str, size: f64, color: &str) {
        let Some(font) = self.font.as_ref() else {
            return;
        };
        self.set_fill(color);
        let layer = self.layer();
        layer.begin_text_section();
        layer.set_font(font, size * PX_TO_PT);
        layer.set_text_matrix(printpdf::TextMatrix::TranslateRotate(
            self.mm_x(x).into(),
            self.mm_y(y).into(),
            90.0,
        ));
        layer.set_text_rendering_mode(printpdf::TextRenderingMode::Fill);
        layer.write_text(s, font);
        layer.end_text_section();
    }
}

const BACKGROUND_COLOR: &str = "#FFFFFF";
const TEXT_COLOR: &str = "#000000";
const OUTLINE_COLOR: &str = "#555555";
const CONNECTOR_COLOR: &str = "#333333";
const OVERLAY_ALPHA: f64 = 0.8;

/// Monospace advance width as a fraction of the font size
const CHAR_WIDTH: f64 = 0.6;
const GENE_NAME_SIZE: f64 = 10.0;
const CONNECTOR_LABEL_SIZE: f64 = 9.0;
const BREAKPOINT_LABEL_SIZE: f64 = 8.0;
const AXIS_LABEL_SIZE: f64 = 9.0;
const AXIS_TICK_STEP: i64 = 1000;
const LEGEND_SWATCH: f64 = 12.0;

/// Everything one render pass needs, borrowed for the duration of a render
struct RenderContext<'a> {
    cfg: &'a RenderConfig,
    scale: Scale,
    regions: &'a [SubtypeRegion],
}

fn text_width(s: &str, size: f64) -> f64 {
    s.chars().count() as f64 * size * CHAR_WIDTH
}

type PassFn = fn(&mut dyn Surface, &RenderContext);

/// Ordered drawing passes. Later passes paint over earlier ones.
const RENDER_PASSES: [(&str, PassFn); 8] = [
    ("background", draw_background),
    ("gene-blocks", draw_gene_blocks),
    ("subtype-overlays", draw_subtype_overlays),
    ("gene-names", draw_gene_names),
    ("splice-connectors", draw_splice_connectors),
    ("breakpoint-marks", draw_breakpoint_marks),
    ("axis", draw_axis),
    ("legend", draw_legend),
];

fn render(surface: &mut dyn Surface, ctx: &RenderContext) {
    for (name, pass) in RENDER_PASSES {
        debug!("render pass: {}", name);
        pass(surface, ctx);
    }
}

fn draw_background(surface: &mut dyn Surface, ctx: &RenderContext) {
    surface.fill_rect(0.0, 0.0, ctx.cfg.width, ctx.cfg.height, BACKGROUND_COLOR);
}

fn draw_gene_blocks(surface: &mut dyn Surface, ctx: &RenderContext) {
    for feature in &GENE_MAP {
        let x = ctx.scale.x(feature.start as f64);
        let w = ctx.scale.x(feature.end as f64) - x;
        let y = ctx.cfg.row_y(feature.row);
        surface.fill_rect(x, y, w, ctx.cfg.row_height, feature.fill);
        if feature.outlined {
            surface.stroke_rect(x, y, w, ctx.cfg.row_height, OUTLINE_COLOR, 1.0);
        }
    }
}

/// One overlay rectangle per region and overlapped gene feature. Spans
/// that merely touch do not overlap.
fn draw_subtype_overlays(surface: &mut dyn Surface, ctx: &RenderContext) {
    for region in ctx.regions {
        for feature in &GENE_MAP {
            let lo = region.start.max(feature.start);
            let hi = region.end.min(feature.end);
            if lo < hi {
                let x = ctx.scale.x(lo as f64);
                let w = ctx.scale.x(hi as f64) - x;
                surface.fill_rect_alpha(
                    x,
                    ctx.cfg.row_y(feature.row),
                    w,
                    ctx.cfg.row_height,
                    region.color,
                    OVERLAY_ALPHA,
                    feature.fill,
                );
            }
        }
    }
}

fn draw_gene_names(surface: &mut dyn Surface, ctx: &RenderContext) {
    for feature in &GENE_MAP {
        if feature.name.is_empty() {
            continue;
        }
        let center = (ctx.scale.x(feature.start as f64) + ctx.scale.x(feature.end as f64)) / 2.0;
        let x = center - text_width(feature.name, GENE_NAME_SIZE) / 2.0;
        let y = ctx.cfg.row_y(feature.row) + ctx.cfg.row_height / 2.0 + GENE_NAME_SIZE / 3.0;
        surface.text(x, y, feature.name, GENE_NAME_SIZE, TEXT_COLOR);
    }
}

/// Edge of a row facing the gap between rows 1 and 2
fn connector_anchor_y(cfg: &RenderConfig, row: u8) -> f64 {
    if row == 1 {
        cfg.row_y(1) + cfg.row_height
    } else {
        cfg.row_y(row)
    }
}

fn draw_splice_connectors(surface: &mut dyn Surface, ctx: &RenderContext) {
    let cfg = ctx.cfg;
    for (name, from_pos, from_row, to_pos, to_row, gap_frac) in CONNECTORS {
        let x1 = ctx.scale.x(from_pos as f64);
        let x2 = ctx.scale.x(to_pos as f64);
        let y1 = connector_anchor_y(cfg, from_row);
        let y2 = connector_anchor_y(cfg, to_row);
        let y_run = cfg.row_y(1) + cfg.row_height + cfg.row_gap * gap_frac;
        surface.polyline(
            &[(x1, y1), (x1, y_run), (x2, y_run), (x2, y2)],
            CONNECTOR_COLOR,
            1.0,
        );

        let mid_x = (x1 + x2) / 2.0;
        let label_y = if from_row == 1 {
            y_run - 3.0
        } else {
            y_run + CONNECTOR_LABEL_SIZE
        };
        surface.text(
            mid_x - text_width(name, CONNECTOR_LABEL_SIZE) / 2.0,
            label_y,
            name,
            CONNECTOR_LABEL_SIZE,
            TEXT_COLOR,
        );
    }
}

fn draw_breakpoint_marks(surface: &mut dyn Surface, ctx: &RenderContext) {
    for bp in breakpoints(ctx.regions) {
        debug!(
            "breakpoint {} (first: {}, last: {})",
            bp.position, bp.is_first, bp.is_last
        );
        let x = ctx.scale.x(bp.position as f64);
        let y_bottom = ctx.cfg.row_top - 4.0;
        let y_top = y_bottom - 12.0;
        surface.line(x, y_top, x, y_bottom, TEXT_COLOR, 1.0);
        surface.rotated_text(
            x + 8.0,
            y_top - 2.0,
            &bp.display_value.to_string(),
            BREAKPOINT_LABEL_SIZE,
            TEXT_COLOR,
        );
    }
}

fn draw_axis(surface: &mut dyn Surface, ctx: &RenderContext) {
    let cfg = ctx.cfg;
    let (d0, d1) = cfg.domain;
    surface.line(ctx.scale.x(d0), cfg.axis_y, ctx.scale.x(d1), cfg.axis_y, TEXT_COLOR, 1.0);

    let mut ticks: Vec<i64> = (0..=(d1 as i64 / AXIS_TICK_STEP))
        .map(|i| i * AXIS_TICK_STEP)
        .filter(|&t| t as f64 >= d0 && (t as f64) < d1)
        .collect();
    ticks.push(d1 as i64);

    for tick in ticks {
        let x = ctx.scale.x(tick as f64);
        surface.line(x, cfg.axis_y, x, cfg.axis_y + 6.0, TEXT_COLOR, 1.0);
        let label = tick.to_string();
        surface.text(
            x - text_width(&label, AXIS_LABEL_SIZE) / 2.0,
            cfg.axis_y + 18.0,
            &label,
            AXIS_LABEL_SIZE,
            TEXT_COLOR,
        );
    }
}

/// One swatch per distinct subtype label, in first-occurrence order
fn draw_legend(surface: &mut dyn Surface, ctx: &RenderContext) {
    let cfg = ctx.cfg;
    let mut seen: FxHashSet<&str> = FxHashSet::default();
    let mut x = cfg.x_margin;
    for region in ctx.regions {
        if !seen.insert(region.label.as_str()) {
            continue;
        }
        surface.fill_rect(x, cfg.legend_y, LEGEND_SWATCH, LEGEND_SWATCH, region.color);
        let text_y = cfg.legend_y + LEGEND_SWATCH / 2.0 + AXIS_LABEL_SIZE / 3.0;
        surface.text(
            x + LEGEND_SWATCH + 5.0,
            text_y,
            &region.label,
            AXIS_LABEL_SIZE,
            TEXT_COLOR,
        );
        x += cfg.legend_step;
    }
}

fn render_svg_string(ctx: &RenderContext) -> String {
    let mut surface = SvgSurface::new(ctx.cfg.width, ctx.cfg.height);
    render(&mut surface, ctx);
    surface.finish()
}

fn write_svg(path: &PathBuf, ctx: &RenderContext) -> Result<()> {
    std::fs::write(path, render_svg_string(ctx))?;
    Ok(())
}

/// Pixels per meter for the 300 dpi pHYs tag
const PNG_PIXELS_PER_METER: u32 = 11811;

/// Encode RGBA pixels as a PNG carrying a 300 dpi resolution tag
fn encode_png(width: u32, height: u32, rgba: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    let mut encoder = png::Encoder::new(&mut out, width, height);
    encoder.set_color(png::ColorType::Rgba);
    encoder.set_depth(png::BitDepth::Eight);
    let mut writer = encoder.write_header()?;

    // pHYs must precede the image data
    let mut phys = [0u8; 9];
    phys[0..4].copy_from_slice(&PNG_PIXELS_PER_METER.to_be_bytes());
    phys[4..8].copy_from_slice(&PNG_PIXELS_PER_METER.to_be_bytes());
    phys[8] = 1; // unit: meter
    writer.write_chunk(png::chunk::pHYs, &phys)?;

    writer.write_image_data(rgba)?;
    writer.finish()?;
    Ok(out)
}

fn write_png(path: &PathBuf, ctx: &RenderContext) -> Result<()> {
    let svg = render_svg_string(ctx);

    let mut options = resvg::usvg::Options::default();
    options.font_family = "DejaVu Sans Mono".to_string();
    options.fontdb_mut().load_system_fonts();
    let tree = resvg::usvg::Tree::from_str(&svg, &options)
        .map_err(|e| anyhow!("failed to parse generated SVG: {}", e))?;

    let size = tree.size().to_int_size();
    let mut pixmap = resvg::tiny_skia::Pixmap::new(size.width(), size.height())
        .ok_or_else(|| anyhow!("failed to allocate {}x{} pixmap", size.width(), size.height()))?;
    resvg::render(&tree, resvg::tiny_skia::Transform::default(), &mut pixmap.as_mut());

    let mut rgba = Vec::with_capacity(pixmap.data().len());
    for px in pixmap.pixels() {
        let c = px.demultiply();
        rgba.extend_from_slice(&[c.red(), c.green(), c.blue(), c.alpha()]);
    }

    let data = encode_png(size.width(), size.height(), &rgba)?;
    std::fs::write(path, data)?;
    Ok(())
}

fn write_pdf(path: &PathBuf, ctx: &RenderContext) -> Result<()> {
    let mut surface = PdfSurface::new(ctx.cfg.width, ctx.cfg.height);
    render(&mut surface, ctx);
    surface.write_to_file(path)
}

fn main() {
    let args = Args::parse();

    // Initialize logger based on verbosity
    env_logger::Builder::new()
        .filter_level(match args.verbose {
            0 => log::LevelFilter::Error,
            1 => log::LevelFilter::Info,
            _ => log::LevelFilter::Debug,
        })
        .init();

    info!("Starting genome map render...");

    if args.png.is_none() && args.pdf.is_none() && args.svg.is_none() {
        eprintln!("Error: no output requested (pass at least one of --png, --pdf, --svg)");
        std::process::exit(1);
    }

    let text = match std::fs::read_to_string(&args.input) {
        Ok(t) => t,
        Err(e) => {
            eprintln!("Error reading annotation file: {}", e);
            std::process::exit(1);
        }
    };

    let mut registry = ColorRegistry::new();
    let parsed = parse_annotations(&text, &mut registry);

    if !parsed.header_seen {
        eprintln!("Error: no '>' header line found in {:?}", args.input);
        std::process::exit(1);
    }
    if parsed.regions.is_empty() {
        eprintln!("Error: no subtype regions found in {:?}", args.input);
        std::process::exit(1);
    }

    info!("Parsed {} subtype regions", parsed.regions.len());

    let cfg = RenderConfig::default();
    let ctx = RenderContext {
        cfg: &cfg,
        scale: cfg.scale(),
        regions: &parsed.regions,
    };

    if let Some(path) = &args.png {
        info!("Writing PNG to {:?}...", path);
        if let Err(e) = write_png(path, &ctx) {
            eprintln!("Error writing PNG: {}", e);
            std::process::exit(1);
        }
    }

    if let Some(path) = &args.pdf {
        info!("Writing PDF to {:?}...", path);
        if let Err(e) = write_pdf(path, &ctx) {
            eprintln!("Error writing PDF: {}", e);
            std::process::exit(1);
        }
    }

    if let Some(path) = &args.svg {
        info!("Writing SVG to {:?}...", path);
        if let Err(e) = write_svg(path, &ctx) {
            eprintln!("Error writing SVG: {}", e);
            std::process::exit(1);
        }
    }

    info!("Done.");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region(start: i64, end: i64, label: &str) -> SubtypeRegion {
        SubtypeRegion {
            start,
            end,
            label: label.to_string(),
            color: "#3F98F2",
        }
    }

    fn svg_for(regions: &[SubtypeRegion]) -> String {
        let cfg = RenderConfig::default();
        let ctx = RenderContext {
            cfg: &cfg,
            scale: cfg.scale(),
            regions,
        };
        render_svg_string(&ctx)
    }

    #[test]
    fn test_default_subtype_color_is_stable() {
        let mut registry = ColorRegistry::new();
        assert_eq!(registry.color_for("B"), "#3F98F2");
        assert_eq!(registry.color_for("B"), "#3F98F2");
    }

    #[test]
    fn test_fallback_colors_assigned_once_per_label() {
        let mut registry = ColorRegistry::new();
        let first = registry.color_for("X1");
        assert_eq!(registry.color_for("X1"), first);
        let second = registry.color_for("X2");
        assert_ne!(first, second);
    }

    #[test]
    fn test_fallback_palette_cycles_after_ten_labels() {
        let mut registry = ColorRegistry::new();
        let first = registry.color_for("X1");
        for i in 2..=10 {
            registry.color_for(&format!("X{}", i));
        }
        assert_eq!(registry.color_for("X11"), first);
    }

    #[test]
    fn test_parse_normalizes_reversed_positions() {
        let mut registry = ColorRegistry::new();
        let parsed = parse_annotations(">seq\n20 10 B\n", &mut registry);
        assert_eq!(parsed.regions.len(), 1);
        assert_eq!(parsed.regions[0].start, 10);
        assert_eq!(parsed.regions[0].end, 20);
    }

    #[test]
    fn test_parse_discards_data_before_header() {
        let mut registry = ColorRegistry::new();
        let parsed = parse_annotations("1 2 A\n>seq\n3 4 B\n", &mut registry);
        assert_eq!(parsed.regions.len(), 1);
        assert_eq!(parsed.regions[0].label, "B");
        assert!(parsed.header_seen);
    }

    #[test]
    fn test_parse_skips_comments_and_blank_lines() {
        let mut registry = ColorRegistry::new();
        let parsed = parse_annotations(
            "# leading comment\n>seq\n\n# inner comment\n100 200 C\n",
            &mut registry,
        );
        assert_eq!(parsed.regions.len(), 1);
        assert_eq!(parsed.regions[0].label, "C");
    }

    #[test]
    fn test_parse_skips_short_and_non_numeric_lines() {
        let mut registry = ColorRegistry::new();
        let parsed = parse_annotations(
            ">seq\n100 200\n100 abc C\nxyz 200 C\n100 200 C\n",
            &mut registry,
        );
        assert_eq!(parsed.regions.len(), 1);
        assert_eq!(parsed.regions[0].start, 100);
    }

    #[test]
    fn test_parse_rejoins_label_fields_with_single_spaces() {
        let mut registry = ColorRegistry::new();
        let parsed = parse_annotations(">seq\n100 200 CRF01   AE variant\n", &mut registry);
        assert_eq!(parsed.regions[0].label, "CRF01 AE variant");
    }

    #[test]
    fn test_parse_without_header_returns_empty() {
        let mut registry = ColorRegistry::new();
        let parsed = parse_annotations("# only comments\n100 200 B\n", &mut registry);
        assert!(parsed.regions.is_empty());
        assert!(!parsed.header_seen);
    }

    #[test]
    fn test_parse_with_header_but_no_data() {
        let mut registry = ColorRegistry::new();
        let parsed = parse_annotations(">seq\n# nothing else\n", &mut registry);
        assert!(parsed.regions.is_empty());
        assert!(parsed.header_seen);
    }

    #[test]
    fn test_scale_maps_domain_to_pixel_range() {
        let cfg = RenderConfig::default();
        let scale = cfg.scale();
        assert_eq!(scale.x(0.0), 40.0);
        assert_eq!(scale.x(9719.0), 860.0);
        assert!(scale.x(-500.0) < 40.0);
        assert!(scale.x(12000.0) > 860.0);
    }

    #[test]
    fn test_breakpoints_empty_input() {
        assert!(breakpoints(&[]).is_empty());
    }

    #[test]
    fn test_breakpoints_single_region() {
        let bps = breakpoints(&[region(100, 500, "B")]);
        assert_eq!(bps.len(), 1);
        assert_eq!(bps[0].position, 100);
        assert!(bps[0].is_first);
        assert!(!bps[0].is_last);
    }

    #[test]
    fn test_breakpoints_many_regions_yield_two_marks() {
        let regions = vec![
            region(3000, 4000, "C"),
            region(100, 500, "B"),
            region(500, 1000, "A1"),
            region(6000, 7000, "D"),
            region(2000, 2500, "B"),
        ];
        let bps = breakpoints(&regions);
        assert_eq!(bps.len(), 2);
        assert_eq!(bps[0].position, 100);
        assert!(bps[0].is_first);
        assert_eq!(bps[1].position, 7000);
        assert!(bps[1].is_last);
    }

    #[test]
    fn test_breakpoints_stable_on_equal_starts() {
        let bps = breakpoints(&[region(100, 900, "B"), region(100, 300, "C")]);
        assert_eq!(bps.len(), 2);
        assert_eq!(bps[0].position, 100);
        assert_eq!(bps[1].position, 300);
    }

    #[test]
    fn test_gene_map_table_shape() {
        assert_eq!(GENE_MAP.len(), 13);
        assert_eq!(GENE_MAP.iter().filter(|f| f.outlined).count(), 2);
        assert!(GENE_MAP.iter().all(|f| f.start < f.end && (1..=3).contains(&f.row)));
    }

    #[test]
    fn test_touching_region_produces_no_overlay() {
        // Sits between the 5' LTR end and the gag start, touching both
        let svg = svg_for(&[region(634, 790, "B")]);
        assert!(!svg.contains("fill-opacity"));
    }

    #[test]
    fn test_region_spanning_rows_overlays_each_feature() {
        // Crosses the gag/pol frame shift, so one overlay per row
        let svg = svg_for(&[region(2000, 2300, "B")]);
        assert_eq!(svg.matches("fill-opacity").count(), 2);
    }

    #[test]
    fn test_svg_canvas_dimensions() {
        let svg = svg_for(&[region(100, 500, "B")]);
        assert!(svg.contains(r#"viewBox="0 0 900 300""#));
    }

    #[test]
    fn test_splice_connectors_drawn_once_each() {
        let svg = svg_for(&[region(100, 500, "B")]);
        assert_eq!(svg.matches("<path ").count(), 2);
        assert_eq!(svg.matches(">tat</text>").count(), 1);
        assert_eq!(svg.matches(">rev</text>").count(), 1);
    }

    #[test]
    fn test_breakpoint_labels_are_rotated() {
        let svg = svg_for(&[region(100, 500, "B")]);
        assert_eq!(svg.matches("rotate(-90").count(), 1);
        let svg = svg_for(&[region(100, 500, "B"), region(500, 1000, "A1")]);
        assert_eq!(svg.matches("rotate(-90").count(), 2);
    }

    #[test]
    fn test_axis_labels_include_domain_end() {
        let svg = svg_for(&[region(100, 500, "B")]);
        assert!(svg.contains(">9719</text>"));
        assert!(svg.contains(">0</text>"));
        assert!(svg.contains(">9000</text>"));
    }

    #[test]
    fn test_legend_keeps_first_occurrence_order() {
        let mut registry = ColorRegistry::new();
        let parsed = parse_annotations(
            ">seq\n100 500 B\n500 1000 A1\n1500 2000 B\n",
            &mut registry,
        );
        let svg = svg_for(&parsed.regions);
        let b_at = svg.find(">B</text>").unwrap();
        let a1_at = svg.find(">A1</text>").unwrap();
        assert!(b_at < a1_at);
        assert_eq!(svg.matches(">B</text>").count(), 1);
    }

    #[test]
    fn test_render_is_deterministic() {
        let text = ">seq1\n100 500 B\n500 1000 A1\n";
        let parsed_a = parse_annotations(text, &mut ColorRegistry::new());
        let parsed_b = parse_annotations(text, &mut ColorRegistry::new());
        assert_eq!(svg_for(&parsed_a.regions), svg_for(&parsed_b.regions));
    }

    #[test]
    fn test_end_to_end_two_region_input() {
        let mut registry = ColorRegistry::new();
        let parsed = parse_annotations(">seq1\n100 500 B\n500 1000 A1\n", &mut registry);
        assert!(parsed.header_seen);
        assert_eq!(parsed.regions.len(), 2);
        assert_eq!(parsed.regions[0].color, "#3F98F2");

        let bps = breakpoints(&parsed.regions);
        assert_eq!(bps.len(), 2);
        assert_eq!((bps[0].position, bps[0].is_first), (100, true));
        assert_eq!((bps[1].position, bps[1].is_last), (1000, true));

        let svg = svg_for(&parsed.regions);
        let b_at = svg.find(">B</text>").unwrap();
        let a1_at = svg.find(">A1</text>").unwrap();
        assert!(b_at < a1_at);
    }

    #[test]
    fn test_encode_png_carries_resolution_tag() {
        let data = encode_png(2, 2, &[0u8; 16]).unwrap();
        assert_eq!(&data[0..8], &[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A]);
        assert!(data.windows(4).any(|w| w == b"pHYs"));
    }

    #[test]
    fn test_write_png_rasterizes_canvas() {
        let cfg = RenderConfig::default();
        let regions = vec![region(100, 500, "B")];
        let ctx = RenderContext {
            cfg: &cfg,
            scale: cfg.scale(),
            regions: &regions,
        };
        let path = std::env::temp_dir().join("hivlook_test_map.png");
        write_png(&path, &ctx).unwrap();
        let data = std::fs::read(&path).unwrap();
        assert_eq!(&data[1..4], b"PNG");
        assert!(data.windows(4).any(|w| w == b"pHYs"));
    }

    #[test]
    fn test_write_pdf_emits_document() {
        let cfg = RenderConfig::default();
        let regions = vec![region(100, 500, "B"), region(500, 1000, "A1")];
        let ctx = RenderContext {
            cfg: &cfg,
            scale: cfg.scale(),
            regions: &regions,
        };
        let path = std::env::temp_dir().join("hivlook_test_map.pdf");
        write_pdf(&path, &ctx).unwrap();
        let data = std::fs::read(&path).unwrap();
        assert!(data.starts_with(b"%PDF"));
    }
}
