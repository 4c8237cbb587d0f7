//! The builtin command surface: one table row per turtle command, consumed
//! at parser start-up to declare the depth-0 names and compile their
//! one-statement chunks.

use turtlepath_engine::TurtleCmd;

pub struct BuiltinCmd {
    pub name: &'static str,
    pub cmd: TurtleCmd,
    pub param_names: &'static [&'static str],
}

const fn cmd(
    name: &'static str,
    cmd: TurtleCmd,
    param_names: &'static [&'static str],
) -> BuiltinCmd {
    BuiltinCmd {
        name,
        cmd,
        param_names,
    }
}

pub const BUILTIN_COMMANDS: &[BuiltinCmd] = &[
    // matrix transforms
    cmd("rotation", TurtleCmd::Rotation, &["angle"]),
    cmd("scaling", TurtleCmd::Scaling, &["x", "y"]),
    cmd("shearing", TurtleCmd::Shearing, &["x", "y"]),
    cmd("reflection", TurtleCmd::Reflection, &["x", "y"]),
    cmd("translation", TurtleCmd::Translation, &["x", "y"]),
    cmd("push_matrix", TurtleCmd::PushMatrix, &[]),
    cmd("pop_matrix", TurtleCmd::PopMatrix, &[]),
    // movement and drawing
    cmd("z", TurtleCmd::ClosePath, &[]),
    cmd("m", TurtleCmd::MoveRel, &["dx", "dy"]),
    cmd("M", TurtleCmd::MoveAbs, &["x", "y"]),
    cmd("r", TurtleCmd::TurnRight, &["angle"]),
    cmd("l", TurtleCmd::TurnLeft, &["angle"]),
    cmd("d", TurtleCmd::SetDir, &["angle"]),
    cmd("f", TurtleCmd::Forward, &["distance"]),
    cmd("j", TurtleCmd::Jump, &["distance"]),
    cmd("a", TurtleCmd::Arc, &["radius", "angle"]),
    cmd("q", TurtleCmd::QuadRel, &["dx", "dy", "angle"]),
    cmd("Q", TurtleCmd::QuadAbs, &["x", "y", "angle"]),
    cmd("t", TurtleCmd::SmoothQuad, &["distance"]),
    cmd(
        "c",
        TurtleCmd::CubicRel,
        &["len1", "angle1", "len2", "angle2", "dx", "dy"],
    ),
    cmd(
        "C",
        TurtleCmd::CubicAbs,
        &["len1", "angle1", "len2", "angle2", "x", "y"],
    ),
    cmd("s", TurtleCmd::SmoothCubicRel, &["len2", "angle2", "dx", "dy"]),
    cmd("S", TurtleCmd::SmoothCubicAbs, &["len2", "angle2", "x", "y"]),
    // right triangles
    cmd("ah", TurtleCmd::AdjacentForHypotenuse, &["angle", "hypotenuse"]),
    cmd("ao", TurtleCmd::AdjacentForOpposite, &["angle", "opposite"]),
    cmd("ha", TurtleCmd::HypotenuseForAdjacent, &["angle", "adjacent"]),
    cmd("ho", TurtleCmd::HypotenuseForOpposite, &["angle", "opposite"]),
    cmd("hb", TurtleCmd::HypotenuseForBoth, &["adjacent", "opposite"]),
    // dx and dy could just as well be called "adjacent" and "opposite"
    cmd("aim", TurtleCmd::Aim, &["dx", "dy"]),
    // compound movement
    cmd("orbit", TurtleCmd::Orbit, &["x", "y", "angle"]),
    cmd("ellipse", TurtleCmd::Ellipse, &["rx", "ry"]),
    // pen and state
    cmd("up", TurtleCmd::PenUp, &[]),
    cmd("down", TurtleCmd::PenDown, &[]),
    cmd("push", TurtleCmd::Push, &[]),
    cmd("pop", TurtleCmd::Pop, &[]),
    // formatted output
    cmd("nl", TurtleCmd::Newline, &[]),
    cmd("sp", TurtleCmd::Space, &[]),
];
