//! Canned posts and collaborator responses for pipeline tests.
#![allow(dead_code)]

use post_enrichment::models::api::{DispatchRequest, PostImage};
use post_enrichment::models::stage::Stage;
use serde_json::{json, Value};

/// What the analysis collaborators report for one image.
#[derive(Debug, Clone)]
pub struct ImageFixture {
    pub image_id: &'static str,
    pub safe: bool,
    pub tags: &'static [&'static str],
    pub scenes: &'static [&'static str],
    pub caption: &'static str,
    pub faces: usize,
}

impl ImageFixture {
    /// Raw collaborator response for `stage`, in the shape the HTTP
    /// endpoints return.
    pub fn response(&self, stage: Stage) -> Value {
        match stage {
            Stage::Moderation => json!({ "is_safe": self.safe, "confidence": 0.97 }),
            Stage::Tagging => json!({
                "tags": self.tags.iter().map(|t| json!({ "label": t, "score": 0.9 })).collect::<Vec<_>>()
            }),
            Stage::Scene => json!({ "result": { "scenes": self.scenes } }),
            Stage::Caption => json!({ "description": self.caption }),
            Stage::Face => json!({
                "faces": (0..self.faces).map(|i| json!({
                    "bounding_box": { "x": 0.1 * i as f64, "y": 0.2, "width": 0.1, "height": 0.1 },
                    "confidence": 0.95
                })).collect::<Vec<_>>()
            }),
        }
    }
}

/// Three safe images: a beach at sunset, two people with drinks, a table of
/// food.
pub const BEACH_POST: &[ImageFixture] = &[
    ImageFixture {
        image_id: "img-a",
        safe: true,
        tags: &["Beach", "sunset"],
        scenes: &["coast"],
        caption: "Sunset over the bay",
        faces: 0,
    },
    ImageFixture {
        image_id: "img-b",
        safe: true,
        tags: &["person", "smile", "Drink"],
        scenes: &["beach"],
        caption: "Two friends toasting",
        faces: 2,
    },
    ImageFixture {
        image_id: "img-c",
        safe: true,
        tags: &["food", "table"],
        scenes: &[],
        caption: "Sunset over the bay",
        faces: 1,
    },
];

/// An office meeting where one image fails moderation.
pub const FLAGGED_POST: &[ImageFixture] = &[
    ImageFixture {
        image_id: "img-x",
        safe: true,
        tags: &["person", "laptop"],
        scenes: &["Conference Room"],
        caption: "Quarterly review",
        faces: 4,
    },
    ImageFixture {
        image_id: "img-y",
        safe: false,
        tags: &["person"],
        scenes: &["office"],
        caption: "Something else",
        faces: 1,
    },
];

pub fn dispatch_request(post_id: &str, images: &[ImageFixture]) -> DispatchRequest {
    DispatchRequest {
        post_id: post_id.to_string(),
        uploader_id: "uploader-1".to_string(),
        images: images
            .iter()
            .map(|image| PostImage {
                image_id: image.image_id.to_string(),
                image_url: format!("https://cdn.example.com/{}.jpg", image.image_id),
            })
            .collect(),
    }
}
