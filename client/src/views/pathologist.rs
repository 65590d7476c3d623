use std::fmt;

use common::{SlideRecord, Status};
use serde_json::Value;
use url::Url;

use crate::api::{ApiError, HttpBackend};

/// Scanned slides only, most urgent first, oldest first within a priority.
pub fn review_list(slides: &[SlideRecord]) -> Vec<&SlideRecord> {
    let mut scanned: Vec<_> = slides
        .iter()
        .filter(|s| s.status() == Status::Completed)
        .collect();
    scanned.sort_by_key(|s| s.queue_key());
    scanned
}

/// Picks a numeric metric out of a result payload, trying `keys` in order.
pub(crate) fn metric(payload: &Value, keys: &[&str]) -> Option<f64> {
    keys.iter().find_map(|k| payload.get(k).and_then(Value::as_f64))
}

/// Payloads report either fractions (below 1) or percentages.
pub(crate) fn as_percent(v: f64) -> f64 {
    if v < 1.0 {
        v * 100.0
    } else {
        v
    }
}

fn percent_or_dash(v: Option<f64>) -> String {
    v.map_or_else(|| "--".to_string(), |v| format!("{:.1}%", as_percent(v)))
}

pub struct ReviewGrid<'a> {
    slides: Vec<&'a SlideRecord>,
}

impl<'a> ReviewGrid<'a> {
    pub fn new(slides: &'a [SlideRecord]) -> Self {
        Self {
            slides: review_list(slides),
        }
    }

    pub fn slides(&self) -> &[&'a SlideRecord] {
        &self.slides
    }

    /// The slide at a 1-based grid position.
    pub fn select(&self, position: usize) -> Option<&'a SlideRecord> {
        position.checked_sub(1).and_then(|i| self.slides.get(i)).copied()
    }
}

impl fmt::Display for ReviewGrid<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Slide Review")?;
        if self.slides.is_empty() {
            return writeln!(f, "  No scanned slides available");
        }
        for (i, slide) in self.slides.iter().enumerate() {
            let (confidence, quality) = slide.result().map_or((None, None), |r| {
                (
                    metric(&r.model_info, &["tumor_confidence", "confidence"]),
                    metric(&r.qc_metrics, &["quality", "tissue_quality"]),
                )
            });
            writeln!(
                f,
                "  {:>3}. {:<32} {:<8} confidence {:>6}  quality {:>6}  {}",
                i + 1,
                slide.filename,
                slide.priority,
                percent_or_dash(confidence),
                percent_or_dash(quality),
                slide.file_id,
            )?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Shape {
    Freehand(Vec<Point>),
    Circle { center: Point, radius: f32 },
    Rect { origin: Point, width: f32, height: f32 },
}

/// A mark drawn over the slide. Lives only as long as the viewer.
#[derive(Debug, Clone, PartialEq)]
pub struct Annotation {
    pub shape: Shape,
    pub label: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum ViewerError {
    #[error("slide {0} has not been scanned")]
    NotScanned(String),
    #[error("turn the prediction overlay on before annotating")]
    OverlayHidden,
    #[error("a freehand stroke needs at least two points")]
    ShortStroke,
    #[error(transparent)]
    Url(#[from] ApiError),
}

/// Detail view of one scanned slide with an optional heatmap overlay and a
/// drawing surface on top of it.
#[derive(Debug)]
pub struct SlideViewer {
    record: SlideRecord,
    image_url: Url,
    tiles_url: Url,
    heatmap_url: Option<Url>,
    show_heatmap: bool,
    annotations: Vec<Annotation>,
}

impl SlideViewer {
    pub fn open(record: SlideRecord, backend: &HttpBackend) -> Result<Self, ViewerError> {
        if record.status() != Status::Completed {
            return Err(ViewerError::NotScanned(record.file_id));
        }
        let heatmap_url = record
            .heatmap_url()
            .map(|path| backend.asset_url(path))
            .transpose()?;
        Ok(Self {
            image_url: backend.image_url(&record.saved_as)?,
            tiles_url: backend.tiles_url(&record.file_id)?,
            heatmap_url,
            record,
            show_heatmap: false,
            annotations: Vec::new(),
        })
    }

    pub fn record(&self) -> &SlideRecord {
        &self.record
    }

    pub fn image_url(&self) -> &Url {
        &self.image_url
    }

    pub fn tiles_url(&self) -> &Url {
        &self.tiles_url
    }

    pub fn heatmap_url(&self) -> Option<&Url> {
        self.heatmap_url.as_ref()
    }

    pub fn heatmap_shown(&self) -> bool {
        self.show_heatmap
    }

    /// Flips the prediction overlay and returns the new state.
    pub fn toggle_heatmap(&mut self) -> bool {
        self.show_heatmap = !self.show_heatmap;
        self.show_heatmap
    }

    /// Places a mark. Returns how many marks are on the slide.
    pub fn annotate(&mut self, annotation: Annotation) -> Result<usize, ViewerError> {
        if !self.show_heatmap {
            return Err(ViewerError::OverlayHidden);
        }
        if let Shape::Freehand(points) = &annotation.shape {
            if points.len() < 2 {
                return Err(ViewerError::ShortStroke);
            }
        }
        self.annotations.push(annotation);
        Ok(self.annotations.len())
    }

    pub fn annotations(&self) -> &[Annotation] {
        &self.annotations
    }

    pub fn undo(&mut self) -> Option<Annotation> {
        self.annotations.pop()
    }

    pub fn clear(&mut self) {
        self.annotations.clear();
    }
}

impl fmt::Display for SlideViewer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let r = &self.record;
        writeln!(f, "{} ({})", r.filename, r.file_id)?;
        writeln!(f, "  priority  {}", r.priority)?;
        writeln!(f, "  image     {}", self.image_url)?;
        writeln!(f, "  tiles     {}", self.tiles_url)?;
        match (&self.heatmap_url, self.show_heatmap) {
            (Some(url), true) => writeln!(f, "  heatmap   {url} (shown)")?,
            (Some(url), false) => writeln!(f, "  heatmap   {url}")?,
            (None, _) => writeln!(f, "  heatmap   not available")?,
        }
        if let Some(result) = r.result() {
            writeln!(f, "  processed in {:.1}s", result.processing_ms as f64 / 1000.0)?;
            if !result.model_info.is_null() {
                writeln!(f, "  model     {}", result.model_info)?;
            }
            if !result.qc_metrics.is_null() {
                writeln!(f, "  qc        {}", result.qc_metrics)?;
            }
        }
        if !self.annotations.is_empty() {
            writeln!(f, "Annotations")?;
            for a in &self.annotations {
                writeln!(f, "  ✓ {}", a.label.as_deref().unwrap_or("(unlabelled)"))?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::RetryPolicy;
    use common::{Priority, ScanResult, SlideState};
    use serde_json::json;

    fn slide(id: &str, time: u64, priority: Priority, state: SlideState) -> SlideRecord {
        let mut s = SlideRecord::queued(id.into(), format!("{id}.png"), format!("{id}.png"), time);
        s.priority = priority;
        s.state = state;
        s
    }

    fn done(heatmap: &str) -> SlideState {
        SlideState::Completed {
            result: Some(ScanResult {
                heatmap_url: heatmap.into(),
                model_info: json!({"tumor_confidence": 0.42}),
                qc_metrics: json!({"quality": 87}),
                processing_ms: 2300,
            }),
        }
    }

    fn backend() -> HttpBackend {
        HttpBackend::new(Url::parse("http://localhost:8000").unwrap(), RetryPolicy::once()).unwrap()
    }

    #[test]
    fn review_shows_completed_by_priority_then_time() {
        let slides = vec![
            slide("a", 1, Priority::Low, done("/h/a.png")),
            slide("b", 2, Priority::Normal, SlideState::Queued),
            slide("c", 3, Priority::High, done("/h/c.png")),
            slide("d", 4, Priority::Low, SlideState::Completed { result: None }),
            slide("e", 5, Priority::Normal, SlideState::Failed { reason: "x".into() }),
            slide("f", 0, Priority::Low, done("/h/f.png")),
        ];
        let ids: Vec<_> = review_list(&slides).iter().map(|s| s.file_id.as_str()).collect();
        assert_eq!(ids, ["c", "f", "a", "d"]);

        let grid = ReviewGrid::new(&slides);
        assert_eq!(grid.select(1).unwrap().file_id, "c");
        assert!(grid.select(0).is_none());
        assert!(grid.select(5).is_none());
        let text = grid.to_string();
        assert!(text.contains("42.0%"));
        assert!(text.contains("87.0%"));
    }

    #[test]
    fn fractions_and_percentages() {
        assert!((as_percent(0.42) - 42.0).abs() < 1e-9);
        assert_eq!(as_percent(1.0), 1.0);
        assert_eq!(as_percent(87.0), 87.0);
        assert_eq!(percent_or_dash(Some(1.0)), "1.0%");
        assert_eq!(percent_or_dash(None), "--");
    }

    #[test]
    fn empty_review() {
        assert!(ReviewGrid::new(&[]).to_string().contains("No scanned slides available"));
    }

    #[test]
    fn viewer_needs_a_scanned_slide() {
        let queued = slide("a", 1, Priority::Normal, SlideState::Queued);
        assert!(matches!(
            SlideViewer::open(queued, &backend()),
            Err(ViewerError::NotScanned(id)) if id == "a"
        ));
    }

    #[test]
    fn viewer_resolves_assets() {
        let viewer =
            SlideViewer::open(slide("a", 1, Priority::Normal, done("/heatmaps/a.png")), &backend())
                .unwrap();
        assert_eq!(viewer.image_url().as_str(), "http://localhost:8000/uploads/a.png");
        assert_eq!(viewer.tiles_url().as_str(), "http://localhost:8000/tiles/a.dzi");
        assert_eq!(
            viewer.heatmap_url().unwrap().as_str(),
            "http://localhost:8000/heatmaps/a.png"
        );

        let restored = SlideViewer::open(
            slide("b", 1, Priority::Normal, SlideState::Completed { result: None }),
            &backend(),
        )
        .unwrap();
        assert!(restored.heatmap_url().is_none());
        assert!(restored.to_string().contains("not available"));
    }

    #[test]
    fn annotations_need_the_overlay_and_stay_local() {
        let mut viewer =
            SlideViewer::open(slide("a", 1, Priority::Normal, done("/h/a.png")), &backend())
                .unwrap();
        let circle = Annotation {
            shape: Shape::Circle {
                center: Point { x: 10.0, y: 20.0 },
                radius: 20.0,
            },
            label: Some("mitosis".into()),
        };
        assert!(matches!(viewer.annotate(circle.clone()), Err(ViewerError::OverlayHidden)));

        assert!(viewer.toggle_heatmap());
        assert_eq!(viewer.annotate(circle).unwrap(), 1);
        let dot = Annotation {
            shape: Shape::Freehand(vec![Point { x: 0.0, y: 0.0 }]),
            label: None,
        };
        assert!(matches!(viewer.annotate(dot), Err(ViewerError::ShortStroke)));
        let stroke = Annotation {
            shape: Shape::Freehand(vec![Point { x: 0.0, y: 0.0 }, Point { x: 5.0, y: 5.0 }]),
            label: None,
        };
        assert_eq!(viewer.annotate(stroke).unwrap(), 2);
        assert!(viewer.to_string().contains("✓ mitosis"));

        assert!(viewer.undo().is_some());
        viewer.clear();
        assert!(viewer.annotations().is_empty());
        // the record itself never carries marks
        assert_eq!(viewer.record().status(), Status::Completed);
    }
}
