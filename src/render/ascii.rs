//! Terminal preview of a rendered image.
//!
//! Fixed one-character-per-pixel grid: `#` for lit pixels, `.` for dark ones.
//! Output is deterministic, which keeps it usable in golden tests.

use crate::domain::Image;

/// Render `image` with a one-line header and a frame.
pub fn render_ascii(image: &Image, title: &str) -> String {
    let (height, width) = image.shape();
    let mut out = String::with_capacity((width + 3) * (height + 3) + title.len());

    out.push_str(&format!("{title} [{height}x{width}]\n"));
    push_border(&mut out, width);
    for row in 0..height {
        out.push('|');
        for col in 0..width {
            out.push(if image.get(row, col) > 0 { '#' } else { '.' });
        }
        out.push_str("|\n");
    }
    push_border(&mut out, width);
    out
}

fn push_border(out: &mut String, width: usize) {
    out.push('+');
    out.push_str(&"-".repeat(width));
    out.push_str("+\n");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_matches_image_shape() {
        let mut img = Image::blank(3, 4);
        img.set(0, 0, 255);
        img.set(2, 3, 255);
        let text = render_ascii(&img, "X 2024-01-05");
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "X 2024-01-05 [3x4]");
        assert_eq!(lines[1], "+----+");
        assert_eq!(lines[2], "|#...|");
        assert_eq!(lines[4], "|...#|");
        assert_eq!(lines.len(), 6);
    }
}
