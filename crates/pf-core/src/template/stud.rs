use serde_json::{Map, Value, json};

use super::{lenient_bool, lenient_f64, lenient_i64};

/// Basket stud inputs in millimetres and degrees
#[derive(Debug, Clone, PartialEq)]
pub struct StudParams {
    pub stone_diameter: f64,
    pub seat_clearance: f64,
    pub wall_thickness: f64,
    pub rim_height: f64,
    /// 4 or 6
    pub prong_count: u32,
    pub prong_thickness: f64,
    pub prong_height: f64,
    pub prong_tilt: f64,
    pub pad_width: f64,
    pub pad_depth: f64,
    pub pad_height: f64,
    pub pad_fillet: f64,
    pub post_diameter: f64,
    pub post_length: f64,
    pub backing_disk: bool,
    pub disk_extra_radius: f64,
    pub disk_thickness: f64,
    pub rail_width: f64,
    pub rail_height: f64,
}

impl Default for StudParams {
    fn default() -> Self {
        Self::from_map(&Map::new())
    }
}

impl StudParams {
    /// Read form inputs; missing or unreadable values take their defaults
    pub fn from_map(params: &Map<String, Value>) -> Self {
        let stone_diameter = lenient_f64(params, "stoneDiameterMm", 6.0);
        let prong_count = match lenient_i64(params, "prongCount", 4) {
            6 => 6,
            _ => 4,
        };
        Self {
            stone_diameter,
            seat_clearance: lenient_f64(params, "seatClearanceMm", 0.15),
            wall_thickness: lenient_f64(params, "basketWallThicknessMm", 0.80),
            rim_height: lenient_f64(params, "rimHeightMm", 1.10),
            prong_count,
            prong_thickness: lenient_f64(params, "prongThicknessMm", 0.90),
            prong_height: lenient_f64(params, "prongHeightMm", (0.32 * stone_diameter).max(1.2)),
            prong_tilt: lenient_f64(params, "prongTiltDeg", 20.0),
            pad_width: lenient_f64(params, "prongPadWidthMm", 0.90),
            pad_depth: lenient_f64(params, "prongPadDepthMm", 0.60),
            pad_height: lenient_f64(params, "prongPadHeightMm", 0.25),
            pad_fillet: lenient_f64(params, "prongPadFilletMm", 0.10),
            post_diameter: lenient_f64(params, "postDiameterMm", 0.90),
            post_length: lenient_f64(params, "postLengthMm", 10.0),
            backing_disk: lenient_bool(params, "includeBackingDisk", true),
            disk_extra_radius: lenient_f64(params, "backDiskExtraRadius", 0.25),
            disk_thickness: lenient_f64(params, "backDiskThickness", 0.70),
            rail_width: lenient_f64(params, "railWidthMm", 0.70),
            rail_height: lenient_f64(params, "railHeightMm", 0.70),
        }
    }

    fn prong_radius(&self) -> f64 {
        (0.5 * self.prong_thickness).max(0.20)
    }

    fn post_radius(&self) -> f64 {
        (self.post_diameter / 2.0).max(0.20)
    }

    /// Inner radius of the rim band, leaving a small bearing ledge for the stone
    pub fn rim_inner(&self) -> f64 {
        let seat = (self.stone_diameter - self.seat_clearance).max(1.0);
        (seat / 2.0 - 0.05).max(1.4)
    }

    pub fn rim_outer(&self) -> f64 {
        self.rim_inner() + self.wall_thickness
    }

    fn parameters(&self) -> Value {
        json!({
            "stoneDiameterMm": self.stone_diameter,
            "seatClearanceMm": self.seat_clearance,
            "basketWallThicknessMm": self.wall_thickness,
            "rimHeightMm": self.rim_height,
            "prongCount": self.prong_count,
            "prongThicknessMm": self.prong_thickness,
            "prongHeightMm": self.prong_height,
            "prongTiltDeg": self.prong_tilt,
            "prongPadWidthMm": self.pad_width,
            "prongPadDepthMm": self.pad_depth,
            "prongPadHeightMm": self.pad_height,
            "prongPadFilletMm": self.pad_fillet,
            "postDiameterMm": self.post_diameter,
            "postLengthMm": self.post_length,
            "includeBackingDisk": self.backing_disk,
            "backDiskExtraRadius": self.disk_extra_radius,
            "backDiskThickness": self.disk_thickness,
            "railWidthMm": self.rail_width,
            "railHeightMm": self.rail_height,
        })
    }

    /// The request document for this stud
    ///
    /// Modeled Z-up with the basket centered on the origin and the post along
    /// +X; the last step turns it Y-up.
    pub fn request(&self) -> Value {
        let rim_inner = self.rim_inner();
        let rim_outer = self.rim_outer();
        let rail_len = 2.0 * rim_inner * 0.96;
        let rail_z = -0.05;
        let z_top = self.rim_height / 2.0;
        let prong_base_z = z_top + self.pad_height;
        let post_x = rim_outer + 0.15;

        let operations = vec![
            json!({"id": "rimBand", "op": "cylinder", "radius": rim_outer, "height": "$rimHeightMm"}),
            json!({"id": "rimBore", "op": "cylinder", "radius": rim_inner, "height": self.rim_height + 0.05,
                "center": [0.0, 0.0, 0.025]}),
            json!({"id": "rim", "op": "subtract", "inputs": ["rimBand", "rimBore"]}),
            json!({"id": "rimSoft", "op": "fillet", "input": "rim", "edges": ">Z or <Z", "radius": 0.08,
                "optional": true}),
            json!({"id": "railX", "op": "box", "size": [rail_len, "$railWidthMm", "$railHeightMm"],
                "center": [0.0, 0.0, rail_z]}),
            json!({"id": "railY", "op": "box", "size": ["$railWidthMm", rail_len, "$railHeightMm"],
                "center": [0.0, 0.0, rail_z]}),
            json!({"id": "rails", "op": "union", "inputs": ["railX", "railY"]}),
            json!({"id": "basket", "op": "union", "inputs": ["rimSoft", "rails"]}),
            // Prong unit at +X: pad on the rim top, rod tilted inward about the tangent
            json!({"id": "pad", "op": "box", "size": ["$prongPadDepthMm", "$prongPadWidthMm", "$prongPadHeightMm"],
                "center": [rim_outer - self.pad_depth / 2.0, 0.0, z_top + self.pad_height / 2.0]}),
            json!({"id": "padSoft", "op": "fillet", "input": "pad", "edges": "|Z",
                "radius": (0.5 * self.pad_width).min(self.pad_fillet), "optional": true}),
            json!({"id": "prongRod", "op": "cylinder", "radius": self.prong_radius(), "height": "$prongHeightMm",
                "center": [rim_outer, 0.0, prong_base_z + self.prong_height / 2.0]}),
            json!({"id": "prong", "op": "rotate", "input": "prongRod", "angle": -self.prong_tilt,
                "axis": [0.0, 1.0, 0.0], "origin": [rim_outer, 0.0, prong_base_z]}),
            json!({"id": "prongUnit", "op": "union", "inputs": ["padSoft", "prong"]}),
            json!({"id": "prongs", "op": "polar_array", "input": "prongUnit", "count": "$prongCount"}),
            json!({"id": "withProngs", "op": "union", "inputs": ["basket", "prongs"]}),
            json!({"id": "post", "op": "cylinder", "radius": self.post_radius(), "height": "$postLengthMm",
                "center": [post_x + self.post_length / 2.0, 0.0, 0.0], "axis": [1.0, 0.0, 0.0]}),
            json!({"id": "withPost", "op": "union", "inputs": ["withProngs", "post"]}),
            json!({"id": "disk", "op": "cylinder", "radius": rim_outer + self.disk_extra_radius,
                "height": "$backDiskThickness", "center": [post_x - self.disk_thickness / 2.0, 0.0, 0.0],
                "axis": [1.0, 0.0, 0.0]}),
            json!({"id": "withDisk", "op": "union", "inputs": ["withPost", "disk"],
                "when": "$includeBackingDisk"}),
            json!({"id": "stud", "op": "rotate", "input": "withDisk", "angle": -90.0, "axis": [1.0, 0.0, 0.0]}),
        ];

        json!({
            "parameters": self.parameters(),
            "operations": operations,
            "outputs": ["stud"]
        })
    }
}

/// Request document for a 4 or 6 prong basket stud
///
/// `params` uses the form field names (`stoneDiameterMm`, `prongCount`,
/// `includeBackingDisk`, ...).
pub fn basket_stud(params: &Map<String, Value>) -> Value {
    StudParams::from_map(params).request()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use crate::engine::{CancelToken, Engine};
    use crate::export::ExportFormat;
    use crate::graph::BuildGraph;
    use crate::pipeline::Pipeline;
    use crate::request::{OpKind, parse_value};
    use approx::assert_relative_eq;
    use pf_kernel::kernel::fake::FakeKernel;
    use pf_kernel::{ImplicitKernel, KernelResult};

    fn map(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    /// Kernel calls needed to evaluate the stud with a fake kernel
    fn fake_calls(params: Value) -> usize {
        let spec = parse_value(&basket_stud(&map(params))).unwrap();
        let graph = BuildGraph::from_spec(&spec).unwrap();
        let kernel = FakeKernel::new();
        let stats = kernel.stats();
        let finished = Engine::default()
            .evaluate(kernel, &spec, &graph, &CancelToken::new())
            .unwrap();
        assert!(finished.warnings().is_empty());
        stats.calls()
    }

    #[test]
    fn test_default_dimensions() {
        let stud = StudParams::default();
        assert_eq!(stud.prong_count, 4);
        assert_relative_eq!(stud.prong_height, 1.92);
        assert_relative_eq!(stud.rim_inner(), 2.875);
        assert_relative_eq!(stud.rim_outer(), 3.675);
        assert!(stud.backing_disk);
    }

    #[test]
    fn test_lenient_inputs() {
        let stud = StudParams::from_map(&map(json!({
            "prongCount": 5,
            "stoneDiameterMm": "large",
            "includeBackingDisk": "no",
            "postLengthMm": "12.5"
        })));
        assert_eq!(stud.prong_count, 4);
        assert_relative_eq!(stud.stone_diameter, 6.0);
        assert!(!stud.backing_disk);
        assert_relative_eq!(stud.post_length, 12.5);

        assert_eq!(StudParams::from_map(&map(json!({"prongCount": "6"}))).prong_count, 6);
        // Small stones keep the minimum rim
        assert_relative_eq!(StudParams::from_map(&map(json!({"stoneDiameterMm": 2}))).rim_inner(), 1.4);
    }

    #[test]
    fn test_request_resolves() {
        let spec = parse_value(&basket_stud(&map(json!({"prongCount": 6, "prongTiltDeg": 15})))).unwrap();
        assert_eq!(spec.outputs(), ["stud".to_string()]);

        let prongs = spec.operations().iter().find(|op| op.id == "prongs").unwrap();
        assert!(matches!(prongs.op, OpKind::PolarArray { count: 6, .. }));
        let prong = spec.operations().iter().find(|op| op.id == "prong").unwrap();
        match &prong.op {
            OpKind::Rotate { angle, .. } => assert_relative_eq!(*angle, -15.0),
            other => panic!("unexpected op {:?}", other),
        }
    }

    #[test]
    fn test_toggles_change_the_build() {
        let full = fake_calls(json!({}));
        assert_eq!(full, 25);
        assert_eq!(fake_calls(json!({"includeBackingDisk": false})), full - 2);
        assert_eq!(fake_calls(json!({"prongCount": 6})), full + 4);

        let with = parse_value(&basket_stud(&Map::new())).unwrap();
        let without = parse_value(&basket_stud(&map(json!({"includeBackingDisk": "off"})))).unwrap();
        assert_ne!(with.fingerprint(), without.fingerprint());
    }

    #[test]
    fn test_reference_kernel_builds_stud() {
        let mut config = PipelineConfig::default();
        config.export.max_cells = 24;
        let factory = || -> KernelResult<ImplicitKernel> { Ok(ImplicitKernel::new()) };
        let outcome = Pipeline::new(factory, &config)
            .run_value(&basket_stud(&Map::new()), &[ExportFormat::Stl], &CancelToken::new())
            .unwrap();

        assert!(!outcome.artifacts[0].is_empty());
        // The rim fillet needs a B-rep kernel; it degrades to the plain rim
        assert!(outcome.warnings.iter().any(|w| w.node == "rimSoft"));
        assert!(outcome.warnings.iter().all(|w| w.node != "padSoft"));
    }
}
