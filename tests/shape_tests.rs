//! Shape family unit tests

#[cfg(test)]
mod tests {
    use battlemat::geom::{GeomError, Rect, Shape, ShapeKind, Vec2};

    fn v(x: i32, y: i32) -> Vec2 {
        Vec2::new(x, y)
    }

    fn shape(kind: ShapeKind, sx: i32, sy: i32, ex: i32, ey: i32) -> Shape {
        Shape::new(kind, v(sx, sy), v(ex, ey))
    }

    // -----------------------------------------------------------------------
    // Factory
    // -----------------------------------------------------------------------

    #[test]
    fn from_kind_parses_every_kind() {
        for (name, kind) in [
            ("mask", ShapeKind::Mask),
            ("circle", ShapeKind::Circle),
            ("cone", ShapeKind::Cone),
            ("cube", ShapeKind::Cube),
            ("line", ShapeKind::Line),
        ] {
            let s = Shape::from_kind(name, v(0, 0), v(3, 0)).unwrap();
            assert_eq!(s.kind(), kind);
        }
    }

    #[test]
    fn from_kind_rejects_unknown() {
        let err = Shape::from_kind("blob", v(0, 0), v(1, 1)).unwrap_err();
        assert_eq!(err, GeomError::UnknownKind("blob".into()));
    }

    // -----------------------------------------------------------------------
    // Emptiness
    // -----------------------------------------------------------------------

    #[test]
    fn empty_iff_degenerate_except_mask() {
        for kind in [
            ShapeKind::Circle,
            ShapeKind::Cone,
            ShapeKind::Cube,
            ShapeKind::Line,
        ] {
            assert!(shape(kind, 2, 2, 2, 2).is_empty(), "{kind} should be empty");
            assert!(!shape(kind, 2, 2, 5, 2).is_empty());
        }
        // A degenerate mask still covers its single cell.
        let m = shape(ShapeKind::Mask, 2, 2, 2, 2);
        assert!(!m.is_empty());
        assert!(m.contains(v(2, 2)));
    }

    // -----------------------------------------------------------------------
    // Endpoint reflexivity
    // -----------------------------------------------------------------------

    #[test]
    fn contains_both_endpoints_when_not_empty() {
        for kind in [
            ShapeKind::Mask,
            ShapeKind::Circle,
            ShapeKind::Cone,
            ShapeKind::Cube,
            ShapeKind::Line,
        ] {
            let s = shape(kind, 1, 1, 6, 4);
            assert!(s.contains(s.start()), "{kind} should contain its start");
            assert!(s.contains(s.end()), "{kind} should contain its end");
        }
    }

    // -----------------------------------------------------------------------
    // Mask
    // -----------------------------------------------------------------------

    #[test]
    fn mask_spans_corners_inclusive_any_orientation() {
        let s = shape(ShapeKind::Mask, 4, 3, 1, 1);
        assert_eq!(s.bounds(), Rect::new(1, 1, 4, 3));
        assert!(s.contains(v(1, 1)));
        assert!(s.contains(v(4, 3)));
        assert!(!s.contains(v(0, 1)));
        assert!(!s.contains(v(5, 3)));
    }

    // -----------------------------------------------------------------------
    // Circle
    // -----------------------------------------------------------------------

    #[test]
    fn circle_uses_squared_distance() {
        // radius² = 9
        let s = shape(ShapeKind::Circle, 0, 0, 3, 0);
        assert!(s.contains(v(0, 3)));
        assert!(s.contains(v(-3, 0)));
        assert!(s.contains(v(2, 2))); // 8 ≤ 9
        assert!(!s.contains(v(2, 3))); // 13 > 9
    }

    #[test]
    fn circle_bounds_cover_radius() {
        let s = shape(ShapeKind::Circle, 5, 5, 8, 5);
        assert_eq!(s.bounds(), Rect::corners(v(2, 2), v(8, 8)));
    }

    // -----------------------------------------------------------------------
    // Cone / cube / line polygons
    // -----------------------------------------------------------------------

    #[test]
    fn line_is_one_cell_thick() {
        let s = shape(ShapeKind::Line, 0, 0, 4, 0);
        let cells: Vec<Vec2> = s.points().collect();
        assert_eq!(cells, vec![v(0, 0), v(1, 0), v(2, 0), v(3, 0), v(4, 0)]);
    }

    #[test]
    fn cube_extends_half_length_each_side() {
        let s = shape(ShapeKind::Cube, 0, 0, 4, 0);
        // Orthogonal extent 4, centered: rows −2..=2 across x 0..=4.
        assert_eq!(s.points().count(), 25);
        assert!(s.contains(v(2, 2)));
        assert!(s.contains(v(2, -2)));
        assert!(!s.contains(v(2, 3)));
        assert!(!s.contains(v(5, 0)));
    }

    #[test]
    fn cone_narrows_toward_apex() {
        let s = shape(ShapeKind::Cone, 0, 0, 4, 0);
        // Base at x=4 spans y −2..=2; the apex admits only its own cell.
        assert!(s.contains(v(4, 2)));
        assert!(s.contains(v(4, -2)));
        assert!(!s.contains(v(0, 1)));
        assert!(!s.contains(v(1, 2)));
    }

    #[test]
    fn diagonal_polygons_round_bounds_outward() {
        let s = shape(ShapeKind::Line, 0, 0, 3, 3);
        let b = s.bounds();
        // Bounds must cover every covered cell, endpoints included.
        assert!(b.contains_cell(v(0, 0)));
        assert!(b.contains_cell(v(3, 3)));
        for p in s.points() {
            assert!(b.contains_cell(p), "point {p} escaped bounds {b}");
        }
    }

    // -----------------------------------------------------------------------
    // Point enumeration
    // -----------------------------------------------------------------------

    #[test]
    fn points_is_restartable() {
        let s = shape(ShapeKind::Circle, 2, 2, 4, 2);
        let first: Vec<Vec2> = s.points().collect();
        let second: Vec<Vec2> = s.points().collect();
        assert_eq!(first, second);
        assert!(!first.is_empty());
    }

    #[test]
    fn points_all_contained() {
        for kind in [ShapeKind::Cone, ShapeKind::Cube, ShapeKind::Line] {
            let s = shape(kind, 1, 2, 6, 5);
            for p in s.points() {
                assert!(s.contains(p));
            }
        }
    }

    // -----------------------------------------------------------------------
    // Rectangle queries
    // -----------------------------------------------------------------------

    #[test]
    fn rect_counts_as_inside_on_any_covered_cell() {
        // radius² = 4 around (2,2)
        let s = shape(ShapeKind::Circle, 2, 2, 4, 2);
        // (4,2) is inside, (5,2) is not; any hit selects the rect.
        assert!(s.contains_rect(&Rect::new(4, 2, 2, 1)));
        // Entirely outside.
        assert!(!s.contains_rect(&Rect::new(5, 5, 2, 2)));
        // Overlaps the bounds but covers no contained cell.
        assert!(!s.contains_rect(&Rect::new(4, 4, 1, 1)));
    }

    // -----------------------------------------------------------------------
    // Equality and serialization
    // -----------------------------------------------------------------------

    #[test]
    fn equality_is_kind_start_end() {
        let a = shape(ShapeKind::Cone, 0, 0, 3, 3);
        let b = shape(ShapeKind::Cone, 0, 0, 3, 3);
        let c = shape(ShapeKind::Cube, 0, 0, 3, 3);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn shape_roundtrips_through_json() {
        let s = shape(ShapeKind::Cube, 1, 2, 5, 6);
        let json = serde_json::to_string(&s).unwrap();
        let back: Shape = serde_json::from_str(&json).unwrap();
        assert_eq!(s, back);
        assert_eq!(s.bounds(), back.bounds());
    }
}
