//! The SVG path turtle.
//!
//! A classic turtle (position + heading + pen) whose drawing commands emit
//! the contents of an SVG `<path>` element's `d` attribute. The turtle knows
//! nothing about formatting: everything goes out through the [`Emitter`]
//! capability, and [`PathWriter`] is the stream-backed implementation.
//!
//! Coordinates given to commands are turtle-space; they are converted to
//! world space through the working transform and the matrix stack at emit
//! time. Lengths convert through a translation-free transform, angles by
//! transforming two points and re-measuring.

mod math;
mod matrix;
mod svg;
mod writer;

pub use matrix::Matrix2d;
pub use svg::SvgConfig;
pub use writer::{double_to_string, OutputFormat, PathWriter};

use math::{atan_d, cos_d, sin_d, tan_d};
use thiserror::Error;

// ===================== Emitter =====================

/// Where path data goes. `emit_char` receives the SVG command letters (and,
/// for readability commands, plain space/newline); numbers and arc flags have
/// their own calls so the writer can manage spacing.
pub trait Emitter {
    fn emit_char(&mut self, _ch: char) {}
    fn emit_flag(&mut self, _flag: bool) {}
    fn emit_number(&mut self, _val: f64) {}

    /// Verbatim output, used by the `<svg>` wrapper around the path data.
    fn emit_raw(&mut self, _text: &str) {}

    /// Called once after execution completes successfully.
    fn finish(&mut self) {}
}

/// Discards everything. Handy default, and the baseline for tests that only
/// care about turtle state.
#[derive(Default)]
pub struct NullEmitter;

impl Emitter for NullEmitter {}

// ===================== Errors =====================

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TurtleError {
    #[error("Parallel lines in q or Q command.")]
    ParallelLines,
    #[error("Empty stack in 'pop' command.")]
    EmptyTurtleStack,
    #[error("Empty stack in 'pop_matrix' command.")]
    EmptyMatrixStack,
    #[error("Invalid reflection arguments x==0 and y==0.")]
    InvalidReflection,
}

type TurtleResult = Result<(), TurtleError>;

// ===================== Geometry plumbing =====================

const EPSILON: f64 = 1e-5;

fn normalize(angle: &mut f64) {
    while *angle >= 360.0 {
        *angle -= 360.0;
    }
    while *angle < 0.0 {
        *angle += 360.0;
    }
}

fn same(d1: f64, d2: f64) -> bool {
    (d2 - d1).abs() <= EPSILON
}

#[derive(Clone, Copy, PartialEq)]
enum AngleAxis {
    Horizontal,
    Vertical,
}

fn angle_axis(mut angle: f64) -> Option<AngleAxis> {
    normalize(&mut angle);

    if same(angle, 0.0) || same(angle, 180.0) {
        return Some(AngleAxis::Horizontal);
    }
    if same(angle, 90.0) || same(angle, 270.0) {
        return Some(AngleAxis::Vertical);
    }
    None
}

/// Points `angle` the way (dx, dy) moved, unless there was no movement.
fn adjust_angle(angle: &mut f64, dx: f64, dy: f64) -> bool {
    if !same(dx, 0.0) || !same(dy, 0.0) {
        *angle = atan_d(dy / dx);

        if dx < 0.0 {
            *angle -= 180.0;
            normalize(angle);
        }

        true
    } else {
        false
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
struct Point {
    x: f64,
    y: f64,
}

impl Point {
    fn shift(&mut self, dx: f64, dy: f64) {
        self.x += dx;
        self.y += dy;
    }
}

/// Mirrors the SVG path state: whether the next draw needs a fresh `M`, and
/// the control point that a following `t` command would reflect.
#[derive(Clone, Copy, Default)]
struct PathState {
    has_moved: bool,
    next_q_control_pt: Option<Point>,
}

impl PathState {
    fn initial() -> Self {
        Self {
            has_moved: true,
            next_q_control_pt: None,
        }
    }

    fn set_has_moved(&mut self) {
        self.has_moved = true;
        self.next_q_control_pt = None;
    }

    // Returns true exactly once per movement, when a draw follows it.
    fn clear_has_moved(&mut self) -> bool {
        if !self.has_moved {
            return false;
        }
        self.has_moved = false;
        self.next_q_control_pt = None;
        true
    }
}

#[derive(Clone, Copy)]
struct TurtleState {
    point: Point,
    dir: f64,
    pen_height: i32,
    path: PathState,
    saved_point_is_valid: bool,
}

impl Default for TurtleState {
    fn default() -> Self {
        Self {
            point: Point::default(),
            dir: 0.0,
            pen_height: 0,
            path: PathState::initial(),
            saved_point_is_valid: true,
        }
    }
}

#[derive(Clone)]
struct MatrixStackItem {
    m: Matrix2d,
    reflected: bool,
}

// ===================== The turtle =====================

pub struct SvgPathTurtle {
    initial_pt: Point,
    state: TurtleState,

    xform: Matrix2d,
    reflected: bool,

    turtle_stack: Vec<TurtleState>,
    matrix_stack: Vec<MatrixStackItem>,

    emitter: Box<dyn Emitter>,
}

impl SvgPathTurtle {
    pub fn new(emitter: Box<dyn Emitter>) -> Self {
        Self {
            initial_pt: Point::default(),
            state: TurtleState::default(),
            xform: Matrix2d::identity(),
            reflected: false,
            turtle_stack: Vec::new(),
            matrix_stack: Vec::new(),
            emitter,
        }
    }

    // ---- inspectors ----------------------------------------------------

    pub fn x(&self) -> f64 {
        self.state.point.x
    }

    pub fn y(&self) -> f64 {
        self.state.point.y
    }

    pub fn dir(&self) -> f64 {
        self.state.dir
    }

    pub fn initial_x(&self) -> f64 {
        self.initial_pt.x
    }

    pub fn initial_y(&self) -> f64 {
        self.initial_pt.y
    }

    pub fn pen_height(&self) -> i32 {
        self.state.pen_height
    }

    pub fn pen_is_on_paper(&self) -> bool {
        self.state.pen_height == 0
    }

    // ---- emitter passthrough -------------------------------------------

    pub fn emit_raw(&mut self, text: &str) {
        self.emitter.emit_raw(text);
    }

    pub fn finish(&mut self) {
        self.emitter.finish();
    }

    // ---- coordinate conversion -----------------------------------------

    fn convert_point(&self, pt: &mut Point, z: f64) {
        self.xform.apply(&mut pt.x, &mut pt.y, z);

        // The matrix stack applies innermost-first (most recent push first).
        for item in self.matrix_stack.iter().rev() {
            item.m.apply(&mut pt.x, &mut pt.y, z);
        }
    }

    fn convert_length(&self, length: f64) -> f64 {
        let mut pt = Point { x: length, y: 0.0 };

        // z == 0 disables translation, so only scale and rotation apply; the
        // rotation is removed again by taking the magnitude.
        self.convert_point(&mut pt, 0.0);

        (pt.x * pt.x + pt.y * pt.y).sqrt()
    }

    fn convert_angle(&self, angle: f64) -> f64 {
        let mut p1 = self.state.point;
        let mut p2 = Point {
            x: p1.x + 200.0 * cos_d(angle),
            y: p1.y + 200.0 * sin_d(angle),
        };

        self.convert_point(&mut p1, 1.0);
        self.convert_point(&mut p2, 1.0);

        atan_d((p2.y - p1.y) / (p2.x - p1.x))
    }

    fn is_reflection_viewport(&self) -> bool {
        self.reflected
    }

    // ---- emit helpers --------------------------------------------------

    fn emit_command(&mut self, ch: char) {
        self.emitter.emit_char(ch);
    }

    fn emit_point(&mut self, mut pt: Point) {
        self.convert_point(&mut pt, 1.0);
        self.emitter.emit_number(pt.x);
        self.emitter.emit_number(pt.y);
    }

    fn emit_length(&mut self, len: f64) {
        let len = self.convert_length(len);
        self.emitter.emit_number(len);
    }

    fn emit_number(&mut self, val: f64) {
        self.emitter.emit_number(val);
    }

    fn emit_flag(&mut self, flag: bool) {
        self.emitter.emit_flag(flag);
    }

    // Every SVG command except Z ends with the destination point, so the
    // draw helpers end by emitting the current position.
    fn end_draw(&mut self) {
        self.emit_point(self.state.point);
    }

    /// Called with the position *before* the move. When the pen is down this
    /// re-anchors the subpath (`M`) if there was intervening movement and
    /// returns true; with the pen up any draw degrades to a move.
    fn prepare_draw(&mut self, current_pt: Point) -> bool {
        if self.pen_is_on_paper() {
            if self.state.path.clear_has_moved() {
                self.emit_command('M');
                self.emit_point(current_pt);

                self.initial_pt = current_pt;
            }

            // About to draw, so positions saved on the stack go stale.
            for state in &mut self.turtle_stack {
                state.saved_point_is_valid = false;
            }

            return true;
        }

        self.state.path.set_has_moved();
        false
    }

    /// Runs movement commands purely for their positional effect: pen up,
    /// path state restored afterwards.
    fn with_pen_up(&mut self, f: impl FnOnce(&mut Self)) {
        let saved_path = self.state.path;
        self.pen_up();
        f(self);
        self.pen_down();
        self.state.path = saved_path;
    }

    fn reflect_q_control_pt(&mut self, mut control_pt: Point) {
        // Reflect the control point around the destination point, for a
        // possible 't' continuation.
        control_pt.x += 2.0 * (self.state.point.x - control_pt.x);
        control_pt.y += 2.0 * (self.state.point.y - control_pt.y);

        self.state.path.next_q_control_pt = Some(control_pt);
    }

    // ---- matrix commands -----------------------------------------------

    pub fn rotation(&mut self, angle: f64) {
        self.xform.rotate(angle);
    }

    pub fn scaling(&mut self, x: f64, y: f64) {
        self.xform.scale(x, y);
    }

    pub fn shearing(&mut self, x: f64, y: f64) {
        self.xform.shear(x, y);
    }

    pub fn reflection(&mut self, x: f64, y: f64) -> TurtleResult {
        if same(x, 0.0) && same(y, 0.0) {
            return Err(TurtleError::InvalidReflection);
        }

        self.xform.reflect(x, y);
        self.reflected = !self.reflected;
        Ok(())
    }

    pub fn translation(&mut self, x: f64, y: f64) {
        self.xform.translate(x, y);
    }

    pub fn push_matrix(&mut self) {
        self.matrix_stack.push(MatrixStackItem {
            m: self.xform.clone(),
            reflected: self.reflected,
        });

        self.xform = Matrix2d::identity();
    }

    pub fn pop_matrix(&mut self) -> TurtleResult {
        let item = self
            .matrix_stack
            .pop()
            .ok_or(TurtleError::EmptyMatrixStack)?;

        self.xform = item.m;
        self.reflected = item.reflected;
        Ok(())
    }

    // ---- heading commands ----------------------------------------------

    pub fn d(&mut self, new_angle: f64) {
        self.state.dir = new_angle;
        normalize(&mut self.state.dir);
    }

    pub fn r(&mut self, angle: f64) {
        self.state.dir += angle;
        normalize(&mut self.state.dir);
    }

    pub fn l(&mut self, angle: f64) {
        self.state.dir -= angle;
        normalize(&mut self.state.dir);
    }

    pub fn aim(&mut self, adjacent: f64, opposite: f64) {
        if !same(adjacent, 0.0) || !same(opposite, 0.0) {
            let mut angle = atan_d(opposite / adjacent);

            if adjacent < 0.0 {
                angle += 180.0;
            }

            self.d(angle);
        }
    }

    // ---- movement and drawing ------------------------------------------

    pub fn m(&mut self, dx: f64, dy: f64) {
        self.state.point.shift(dx, dy);
        self.state.path.set_has_moved();
    }

    #[allow(non_snake_case)]
    pub fn M(&mut self, x: f64, y: f64) {
        self.state.point = Point { x, y };
        self.state.path.set_has_moved();
    }

    pub fn f(&mut self, distance: f64) {
        let current_pt = self.state.point;

        self.state.point.shift(
            distance * cos_d(self.state.dir),
            distance * sin_d(self.state.dir),
        );

        if self.prepare_draw(current_pt) {
            self.emit_command('L');
            self.end_draw();
        }
    }

    pub fn jump(&mut self, distance: f64) {
        self.state.point.shift(
            distance * cos_d(self.state.dir),
            distance * sin_d(self.state.dir),
        );

        self.state.path.set_has_moved();
    }

    pub fn arc(&mut self, radius: f64, mut angle: f64) {
        let current_pt = self.state.point;

        let mut sweep = angle >= 0.0;
        let walk_rotation = if sweep { 90.0 } else { -90.0 };

        if self.is_reflection_viewport() {
            sweep = !sweep;
        }

        while angle > 360.0 {
            angle -= 360.0;
        }
        while angle < -360.0 {
            angle += 360.0;
        }

        if same(angle, 0.0) {
            return;
        }

        let large_arc = angle.abs() >= 180.0;

        // Walking the chord with no-output commands is the "turtle way" to
        // find the endpoint of the arc.
        self.with_pen_up(|t| {
            t.r(walk_rotation);
            t.jump(radius);
            t.r(angle - 180.0);
            t.jump(radius);
            t.r(walk_rotation);
        });

        if self.prepare_draw(current_pt) {
            self.emit_command('A');
            self.emit_length(radius);
            self.emit_length(radius);
            self.emit_number(0.0);
            self.emit_flag(large_arc);
            self.emit_flag(sweep);
            self.end_draw();
        }
    }

    /// Quadratic curve: the control point is the intersection of the current
    /// heading line with the line through the destination at `angle`.
    pub fn q(&mut self, dx: f64, dy: f64, mut angle: f64) -> TurtleResult {
        let current_pt = self.state.point;

        normalize(&mut angle);

        let x = self.state.point.x;
        let y = self.state.point.y;

        let m1 = tan_d(self.state.dir);
        let m2 = tan_d(angle);

        let t1 = angle_axis(self.state.dir);
        let t2 = angle_axis(angle);

        let mut control_pt = Point::default();

        if t1 == Some(AngleAxis::Vertical) || t2 == Some(AngleAxis::Vertical) {
            if t1 == t2 {
                return Err(TurtleError::ParallelLines);
            }

            if t1 == Some(AngleAxis::Vertical) {
                control_pt.x = x;
                control_pt.y = m2 * -dx + y + dy;
            } else {
                control_pt.x = x + dx;
                control_pt.y = m1 * dx + y;
            }
        } else if same(m1, m2) {
            return Err(TurtleError::ParallelLines);
        } else {
            // intersection of the lines (x, y, dir) and (x+dx, y+dy, angle)
            control_pt.x = ((m1 * x - m2 * (x + dx)) + dy) / (m1 - m2);
            control_pt.y = m1 * (control_pt.x - x) + y;
        }

        self.state.point.shift(dx, dy);
        self.state.dir = angle;

        if self.prepare_draw(current_pt) {
            self.emit_command('Q');
            self.emit_point(control_pt);
            self.end_draw();
        }

        self.reflect_q_control_pt(control_pt);
        Ok(())
    }

    #[allow(non_snake_case)]
    pub fn Q(&mut self, x: f64, y: f64, angle: f64) -> TurtleResult {
        self.q(x - self.state.point.x, y - self.state.point.y, angle)
    }

    /// Smooth quadratic continuation.
    pub fn t(&mut self, distance: f64) {
        let current_pt = self.state.point;

        self.with_pen_up(|t| t.jump(distance));

        let control = self.state.path.next_q_control_pt;

        if let Some(control_pt) = control {
            let dx = self.state.point.x - control_pt.x;
            let dy = self.state.point.y - control_pt.y;

            adjust_angle(&mut self.state.dir, dx, dy);
        }

        if self.prepare_draw(current_pt) {
            self.emit_command('T');
            self.end_draw();
        }

        if let Some(control_pt) = control {
            self.reflect_q_control_pt(control_pt);
        }
    }

    /// Cubic curve; control points given as (length, angle) from the start
    /// point and *into* the end point.
    pub fn c(&mut self, l1: f64, mut a1: f64, l2: f64, mut a2: f64, dx: f64, dy: f64) {
        if self.pen_is_on_paper() {
            let current_pt = self.state.point;

            normalize(&mut a1);
            normalize(&mut a2);

            let x = self.state.point.x;
            let y = self.state.point.y;

            let start_control_pt = Point {
                x: x + l1 * cos_d(a1),
                y: y + l1 * sin_d(a1),
            };

            let end_control_pt = Point {
                x: x + dx - l2 * cos_d(a2),
                y: y + dy - l2 * sin_d(a2),
            };

            self.state.point.shift(dx, dy);
            self.state.dir = a2;

            if self.prepare_draw(current_pt) {
                self.emit_command('C');
                self.emit_point(start_control_pt);
                self.emit_point(end_control_pt);
                self.end_draw();
            }
        } else {
            self.state.point.shift(dx, dy);
            self.state.dir = a2;
        }
    }

    #[allow(non_snake_case)]
    pub fn C(&mut self, l1: f64, a1: f64, l2: f64, a2: f64, x: f64, y: f64) {
        self.c(
            l1,
            a1,
            l2,
            a2,
            x - self.state.point.x,
            y - self.state.point.y,
        );
    }

    /// Smooth cubic continuation: only the incoming control point is given.
    pub fn s(&mut self, l2: f64, mut a2: f64, dx: f64, dy: f64) {
        if self.pen_is_on_paper() {
            let current_pt = self.state.point;

            normalize(&mut a2);

            let x = self.state.point.x;
            let y = self.state.point.y;

            let end_control_pt = Point {
                x: x + dx - l2 * cos_d(a2),
                y: y + dy - l2 * sin_d(a2),
            };

            self.state.point.shift(dx, dy);
            self.state.dir = a2;

            if self.prepare_draw(current_pt) {
                self.emit_command('S');
                self.emit_point(end_control_pt);
                self.end_draw();
            }
        } else {
            self.state.point.shift(dx, dy);
            self.state.dir = a2;
        }
    }

    #[allow(non_snake_case)]
    pub fn S(&mut self, l2: f64, a2: f64, x: f64, y: f64) {
        self.s(l2, a2, x - self.state.point.x, y - self.state.point.y);
    }

    /// Closes the subpath, teleporting back to the subpath's first point.
    pub fn z(&mut self) {
        let dx = self.initial_pt.x - self.state.point.x;
        let dy = self.initial_pt.y - self.state.point.y;

        let current_pt = self.state.point;

        self.state.point = self.initial_pt;

        adjust_angle(&mut self.state.dir, dx, dy);

        if self.prepare_draw(current_pt) {
            // Z is the one command with no destination point.
            self.emit_command('Z');

            for state in &mut self.turtle_stack {
                state.saved_point_is_valid = false;
            }
        }
    }

    // ---- right-triangle commands ---------------------------------------

    pub fn adjacent_for_hypotenuse(&mut self, angle: f64, hypotenuse: f64) {
        self.f(hypotenuse * cos_d(angle));
    }

    pub fn adjacent_for_opposite(&mut self, angle: f64, opposite: f64) {
        self.f(opposite / tan_d(angle));
    }

    pub fn hypotenuse_for_adjacent(&mut self, angle: f64, adjacent: f64) {
        self.f(adjacent / cos_d(angle));
    }

    pub fn hypotenuse_for_opposite(&mut self, angle: f64, opposite: f64) {
        self.f(opposite / sin_d(angle));
    }

    pub fn hypotenuse_for_both(&mut self, adjacent: f64, opposite: f64) {
        let distance = (adjacent * adjacent + opposite * opposite).sqrt();

        if distance != 0.0 {
            self.f(distance);
        }
    }

    // ---- compound commands ---------------------------------------------

    /// Circles around (cx, cy) by `angle` degrees, at the current radius.
    pub fn orbit(&mut self, cx: f64, cy: f64, angle: f64) {
        let dx = self.state.point.x - cx;
        let dy = self.state.point.y - cy;

        if adjust_angle(&mut self.state.dir, dx, dy) {
            self.r(if angle < 0.0 { -90.0 } else { 90.0 });

            let radius = (dx * dx + dy * dy).sqrt();

            self.arc(radius, angle);
        }
    }

    /// Draws a full ellipse centered on the turtle, as two arc halves.
    pub fn ellipse(&mut self, rx: f64, ry: f64) {
        let angle = self.state.dir;

        let dx = rx * cos_d(angle);
        let dy = rx * sin_d(angle);

        self.push();

        self.m(dx, dy);
        self.r(90.0);

        let world_angle = self.convert_angle(angle);

        let mut current_pt = self.state.point;
        self.state.point.shift(-dx * 2.0, -dy * 2.0);

        if self.prepare_draw(current_pt) {
            self.emit_command('A');
            self.emit_length(rx);
            self.emit_length(ry);
            self.emit_number(world_angle);
            self.emit_number(0.0);
            self.emit_number(1.0);
            self.end_draw();
        }

        current_pt = self.state.point;
        self.state.point.shift(dx * 2.0, dy * 2.0);

        if self.prepare_draw(current_pt) {
            self.emit_command('A');
            self.emit_length(rx);
            self.emit_length(ry);
            self.emit_number(world_angle);
            self.emit_number(0.0);
            self.emit_number(1.0);
            self.end_draw();
        }

        // The matching push() is just above; the stack cannot be empty.
        let _ = self.pop();
    }

    // ---- formatting commands -------------------------------------------

    pub fn nl(&mut self) {
        self.emit_command('\n');
    }

    pub fn sp(&mut self) {
        self.emit_command(' ');
    }

    // ---- state commands ------------------------------------------------

    pub fn pen_up(&mut self) {
        self.state.pen_height += 1;
    }

    pub fn pen_down(&mut self) {
        self.state.pen_height -= 1;
    }

    pub fn push(&mut self) {
        self.state.saved_point_is_valid = true;
        self.turtle_stack.push(self.state);
    }

    pub fn pop(&mut self) -> TurtleResult {
        let state = self
            .turtle_stack
            .pop()
            .ok_or(TurtleError::EmptyTurtleStack)?;

        self.state = state;

        // If drawing happened since the push, the restored position no
        // longer matches the path's current point.
        if !self.state.saved_point_is_valid {
            self.state.path.set_has_moved();
        }

        Ok(())
    }
}

// ===================== Tests =====================

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    /// Records emitted items, so tests can assert on the exact command
    /// stream without going through number formatting.
    #[derive(Clone, Debug, PartialEq)]
    pub enum Item {
        Cmd(char),
        Num(f64),
        Flag(bool),
    }

    #[derive(Clone, Default)]
    pub struct Recorder {
        items: Rc<RefCell<Vec<Item>>>,
    }

    impl Recorder {
        pub fn new() -> (Self, Rc<RefCell<Vec<Item>>>) {
            let rec = Self::default();
            let items = rec.items.clone();
            (rec, items)
        }
    }

    impl Emitter for Recorder {
        fn emit_char(&mut self, ch: char) {
            self.items.borrow_mut().push(Item::Cmd(ch));
        }

        fn emit_flag(&mut self, flag: bool) {
            self.items.borrow_mut().push(Item::Flag(flag));
        }

        fn emit_number(&mut self, val: f64) {
            self.items.borrow_mut().push(Item::Num(val));
        }
    }

    fn turtle() -> (SvgPathTurtle, Rc<RefCell<Vec<Item>>>) {
        let (rec, items) = Recorder::new();
        (SvgPathTurtle::new(Box::new(rec)), items)
    }

    fn nums(items: &[Item]) -> Vec<f64> {
        items
            .iter()
            .filter_map(|i| match i {
                Item::Num(v) => Some(*v),
                _ => None,
            })
            .collect()
    }

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn forward_draws_a_line_with_leading_move() {
        let (mut t, items) = turtle();
        t.f(10.0);

        let items = items.borrow();
        assert_eq!(items[0], Item::Cmd('M'));
        assert_eq!(items[3], Item::Cmd('L'));
        let ns = nums(&items);
        assert_eq!(ns.len(), 4);
        assert!(close(ns[2], 10.0) && close(ns[3], 0.0));
    }

    #[test]
    fn heading_turns_are_degrees_ccw() {
        let (mut t, items) = turtle();
        t.r(90.0);
        t.f(5.0);

        let ns = nums(&items.borrow());
        assert!(close(ns[2], 0.0) && close(ns[3], 5.0));
        assert!(close(t.dir(), 90.0));
    }

    #[test]
    fn pen_up_degrades_draw_to_move() {
        let (mut t, items) = turtle();
        t.pen_up();
        t.f(10.0);
        t.pen_down();
        t.f(5.0);

        // Only the second f draws, with the M anchored at (10, 0).
        let items = items.borrow();
        assert_eq!(items[0], Item::Cmd('M'));
        let ns = nums(&items);
        assert!(close(ns[0], 10.0) && close(ns[1], 0.0));
        assert!(close(ns[2], 15.0) && close(ns[3], 0.0));
    }

    #[test]
    fn movement_reanchors_subpath() {
        let (mut t, items) = turtle();
        t.f(1.0);
        t.m(5.0, 5.0);
        t.f(1.0);

        let cmds: Vec<_> = items
            .borrow()
            .iter()
            .filter_map(|i| match i {
                Item::Cmd(c) => Some(*c),
                _ => None,
            })
            .collect();
        assert_eq!(cmds, vec!['M', 'L', 'M', 'L']);
    }

    #[test]
    fn z_closes_back_to_subpath_start() {
        let (mut t, items) = turtle();
        t.f(10.0);
        t.r(90.0);
        t.f(10.0);
        t.z();

        let items = items.borrow();
        assert_eq!(items.last(), Some(&Item::Cmd('Z')));
        assert!(close(t.x(), 0.0) && close(t.y(), 0.0));
        // And the heading follows the closing edge.
        assert!(close(t.dir(), 225.0));
    }

    #[test]
    fn arc_emits_radii_rotation_and_flags() {
        let (mut t, items) = turtle();
        t.arc(10.0, 90.0);

        let items = items.borrow();
        assert_eq!(items[0], Item::Cmd('M'));
        assert_eq!(items[3], Item::Cmd('A'));
        assert_eq!(items[6], Item::Num(0.0));
        assert_eq!(items[7], Item::Flag(false));
        assert_eq!(items[8], Item::Flag(true));

        // 90 degrees counterclockwise from (0,0) heading east lands at
        // (10, 10) for a radius-10 arc centered at (0, 10).
        let ns = nums(&items);
        let (x, y) = (ns[ns.len() - 2], ns[ns.len() - 1]);
        assert!(close(x, 10.0) && close(y, 10.0), "got ({x}, {y})");
    }

    #[test]
    fn arc_with_zero_angle_is_silent() {
        let (mut t, items) = turtle();
        t.arc(10.0, 0.0);
        t.arc(10.0, 360.0 * 3.0); // wraps down to zero
        assert!(items.borrow().is_empty());
    }

    #[test]
    fn q_control_point_straight_lines_error() {
        let (mut t, _) = turtle();
        // Heading east, destination line also horizontal: parallel.
        assert_eq!(t.q(10.0, 0.0, 180.0), Err(TurtleError::ParallelLines));
    }

    #[test]
    fn q_control_point_intersection() {
        let (mut t, items) = turtle();
        // Heading east from origin; arrive at (10, 10) moving north.
        t.q(10.0, 10.0, 90.0).unwrap();

        let items = items.borrow();
        assert_eq!(items[3], Item::Cmd('Q'));
        let ns = nums(&items);
        // Control point is the corner (10, 0).
        assert!(close(ns[2], 10.0) && close(ns[3], 0.0));
        assert!(close(ns[4], 10.0) && close(ns[5], 10.0));
        assert!(close(t.dir(), 90.0));
    }

    #[test]
    fn pop_on_empty_stack_errors() {
        let (mut t, _) = turtle();
        assert_eq!(t.pop(), Err(TurtleError::EmptyTurtleStack));
        assert_eq!(t.pop_matrix(), Err(TurtleError::EmptyMatrixStack));
    }

    #[test]
    fn push_pop_restores_state() {
        let (mut t, _) = turtle();
        t.r(45.0);
        t.push();
        t.d(160.0);
        t.jump(12.0);
        t.pop().unwrap();
        assert!(close(t.dir(), 45.0));
        assert!(close(t.x(), 0.0) && close(t.y(), 0.0));
    }

    #[test]
    fn reflection_needs_a_direction() {
        let (mut t, _) = turtle();
        assert_eq!(t.reflection(0.0, 0.0), Err(TurtleError::InvalidReflection));
        assert_eq!(t.reflection(1.0, 0.0), Ok(()));
    }

    #[test]
    fn reflection_flips_arc_sweep() {
        let (mut t, items) = turtle();
        t.reflection(1.0, 0.0).unwrap();
        t.arc(10.0, 90.0);

        let items = items.borrow();
        // Sweep flag flipped by the reflection parity.
        assert_eq!(items[8], Item::Flag(false));
    }

    #[test]
    fn translation_moves_world_coordinates() {
        let (mut t, items) = turtle();
        t.translation(100.0, 50.0);
        t.f(10.0);

        let ns = nums(&items.borrow());
        assert!(close(ns[0], 100.0) && close(ns[1], 50.0));
        assert!(close(ns[2], 110.0) && close(ns[3], 50.0));
        // Turtle-space position is unaffected by the world transform.
        assert!(close(t.x(), 10.0));
    }

    #[test]
    fn push_matrix_starts_from_identity() {
        let (mut t, items) = turtle();
        t.scaling(2.0, 2.0);
        t.push_matrix();
        t.f(10.0);

        // The new working matrix is identity, but the stacked scaling still
        // applies to world conversion.
        let ns = nums(&items.borrow());
        assert!(close(ns[2], 20.0) && close(ns[3], 0.0));

        t.pop_matrix().unwrap();
        t.f(10.0);
        let _ = t;
    }

    #[test]
    fn aim_points_along_vector() {
        let (mut t, _) = turtle();
        t.aim(0.0, 5.0);
        assert!(close(t.dir(), 90.0));
        t.aim(-1.0, 0.0);
        assert!(close(t.dir(), 180.0));
        // aim with no direction leaves the heading alone
        t.aim(0.0, 0.0);
        assert!(close(t.dir(), 180.0));
    }

    #[test]
    fn triangle_commands_travel_the_named_side() {
        let (mut t, _) = turtle();
        t.adjacent_for_hypotenuse(60.0, 10.0);
        assert!(close(t.x(), 5.0));

        let (mut t, _) = turtle();
        t.hypotenuse_for_opposite(30.0, 5.0);
        assert!(close(t.x(), 10.0));

        let (mut t, _) = turtle();
        t.hypotenuse_for_both(3.0, 4.0);
        assert!(close(t.x(), 3.0) && close(t.y(), 4.0));
    }

    #[test]
    fn smooth_quadratic_follows_reflected_control() {
        let (mut t, items) = turtle();
        t.q(10.0, 10.0, 90.0).unwrap();
        t.t(10.0);

        let items = items.borrow();
        let cmds: Vec<_> = items
            .iter()
            .filter_map(|i| match i {
                Item::Cmd(c) => Some(*c),
                _ => None,
            })
            .collect();
        assert_eq!(cmds, vec!['M', 'Q', 'T']);
    }
}
