//! Optional `<svg>` wrapper around the emitted path data, for eyeballing
//! output in a browser without a compositor.

#[derive(Clone, Debug)]
pub struct SvgConfig {
    enabled: bool,
    width: i64,
    height: i64,
    background_color: String,

    fill_color: String,
    stroke_color: String,
    stroke_width: String,
    stroke_linejoin: String,
    stroke_linecap: String,
}

impl Default for SvgConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            width: 500,
            height: 500,
            background_color: "white".to_string(),
            fill_color: "lightblue".to_string(),
            stroke_color: "black".to_string(),
            stroke_width: "1.5".to_string(),
            stroke_linejoin: "round".to_string(),
            stroke_linecap: "round".to_string(),
        }
    }
}

impl SvgConfig {
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn enable(&mut self) {
        self.enabled = true;
    }

    /// Parses `"w h [bg fill stroke width join cap]"`. Also enables.
    pub fn configure(&mut self, config: &str) -> bool {
        self.enable();

        let mut fields = config.split_whitespace();

        let (Some(w), Some(h)) = (fields.next(), fields.next()) else {
            return false;
        };

        let (Ok(w), Ok(h)) = (w.parse(), h.parse()) else {
            return false;
        };

        self.width = w;
        self.height = h;

        let targets: [&mut String; 6] = [
            &mut self.background_color,
            &mut self.fill_color,
            &mut self.stroke_color,
            &mut self.stroke_width,
            &mut self.stroke_linejoin,
            &mut self.stroke_linecap,
        ];

        for target in targets {
            match fields.next() {
                Some(value) => *target = value.to_string(),
                None => break,
            }
        }

        true
    }

    /// Everything up to (and including) `d="`.
    pub fn header(&self) -> String {
        let mut out = format!(
            "<svg viewbox=\"0 0 {w} {h}\" width=\"{w}\" height=\"{h}\" \
             xmlns=\"http://www.w3.org/2000/svg\">\n",
            w = self.width,
            h = self.height,
        );

        if !self.background_color.is_empty() {
            out.push_str(&format!(
                "<rect x=\"0\" y=\"0\" width=\"100%\" height=\"100%\" fill=\"{}\"/>\n",
                self.background_color
            ));
        }

        out.push_str(&format!(
            "<path fill=\"{}\" stroke=\"{}\" stroke-width=\"{}\" \
             stroke-linejoin=\"{}\" stroke-linecap=\"{}\" d=\"",
            self.fill_color,
            self.stroke_color,
            self.stroke_width,
            self.stroke_linejoin,
            self.stroke_linecap
        ));

        out
    }

    pub fn footer(&self) -> String {
        "\"/>\n</svg>\n".to_string()
    }
}
