use image::{codecs::jpeg::JpegEncoder, Rgb, RgbImage};
use snafu::{ResultExt, Snafu};

use crate::config::{models::PrinterClass, PrinterConfig};

use super::context::PrintContext;

/// A print-ready document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedDocument {
    pub mime: &'static str,
    pub bytes: Vec<u8>,
}

/// Turns a template into printable bytes.
pub trait Renderer: Send + Sync {
    fn render(&self, template: &str, printer: &PrinterConfig, context: &PrintContext) -> Result<RenderedDocument, RenderError>;
}

// Letter size at 100 dpi.
const PAGE_WIDTH: u32 = 850;
const PAGE_HEIGHT: u32 = 1100;
const MARGIN: u32 = 60;

const INK_BARS: [[u8; 3]; 7] = [
    [0, 255, 255],
    [255, 0, 255],
    [255, 255, 0],
    [0, 0, 0],
    [255, 0, 0],
    [0, 160, 0],
    [0, 0, 255],
];

/// Draws full-width colour bars (a grey ramp for laser printers) so every
/// nozzle or drum gets exercised. Text templates fall back to this page.
#[derive(Debug, Default, Clone, Copy)]
pub struct ColorBarsRenderer;

impl ColorBarsRenderer {
    fn bars(class: PrinterClass) -> Vec<[u8; 3]> {
        match class {
            PrinterClass::Inkjet => INK_BARS.to_vec(),
            PrinterClass::Laser => (0..8u8).map(|step| {
                let grey = step * 32;
                [grey, grey, grey]
            }).collect(),
        }
    }

    fn page(class: PrinterClass, context: &PrintContext) -> RgbImage {
        let bars = Self::bars(class);
        let band_height = (PAGE_HEIGHT - 2 * MARGIN) / 2;
        let bar_height = band_height / bars.len() as u32;
        // Tick marks along the bottom encode the day of the month, one per day.
        let ticks = chrono::Datelike::day(&context.printed_at);

        RgbImage::from_fn(PAGE_WIDTH, PAGE_HEIGHT, |x, y| {
            let inside = x >= MARGIN && x < PAGE_WIDTH - MARGIN;
            if inside && y >= MARGIN && y < MARGIN + bar_height * bars.len() as u32 {
                return Rgb(bars[((y - MARGIN) / bar_height) as usize]);
            }
            let tick_row = PAGE_HEIGHT - MARGIN - 20;
            if inside && y >= tick_row && y < tick_row + 12 {
                let slot = (x - MARGIN) / 20;
                if slot < ticks && (x - MARGIN) % 20 < 10 {
                    return Rgb([0, 0, 0]);
                }
            }
            Rgb([255, 255, 255])
        })
    }
}

impl Renderer for ColorBarsRenderer {
    fn render(&self, template: &str, printer: &PrinterConfig, context: &PrintContext) -> Result<RenderedDocument, RenderError> {
        let page = Self::page(printer.class, context);
        let mut bytes = Vec::new();
        JpegEncoder::new_with_quality(&mut bytes, 90)
            .encode_image(&page)
            .context(EncodeSnafu { template })?;
        Ok(RenderedDocument { mime: "image/jpeg", bytes })
    }
}

// ////// //
// Errors //
// ////// //

#[derive(Debug, Snafu)]
pub enum RenderError {
    #[snafu(display("Could not encode page for template '{template}'"))]
    Encode { template: String, source: image::ImageError },
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::Utc;

    use super::*;
    use crate::keepalive::context::Trigger;

    #[test]
    fn renders_a_jpeg() {
        let now = Utc::now();
        let printer = PrinterConfig {
            id: "office".to_owned(),
            name: "Office".to_owned(),
            uri: "ipp://10.0.0.1/ipp/print".to_owned(),
            class: PrinterClass::Laser,
            cadence: Duration::from_secs(3600),
            enabled: true,
            secure: false,
            template: "color_bars".to_owned(),
        };
        let context = PrintContext::new(Trigger::Cli, true, printer.cadence, now, now, now);

        let document = ColorBarsRenderer.render("color_bars", &printer, &context).unwrap();
        assert_eq!(document.mime, "image/jpeg");
        assert_eq!(&document.bytes[..2], &[0xFF, 0xD8]);
    }
}
