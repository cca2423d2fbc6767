/*
sparseconv, to convert between raw and Android sparse images: progress module
Copyright (C) 2024-present Guoxin "7Ji" Pu

This program is free software: you can redistribute it and/or modify
it under the terms of the GNU Affero General Public License as
published by the Free Software Foundation, either version 3 of the
License, or (at your option) any later version.

This program is distributed in the hope that it will be useful,
but WITHOUT ANY WARRANTY; without even the implied warranty of
MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
GNU Affero General Public License for more details.

You should have received a copy of the GNU Affero General Public License
along with this program.  If not, see <https://www.gnu.org/licenses/>.
*/

use indicatif::{ProgressBar, ProgressStyle};
use tracing::error;

use crate::Result;

pub(crate) const TEMPLATE_BLOCKS: &str =
    "Compressing => [{elapsed_precise}] {bar:40.cyan/blue} {pos:>7}/{len:7} blocks {msg}";

pub(crate) const TEMPLATE_CHUNKS: &str =
    "Decompressing => [{elapsed_precise}] {bar:40.cyan/blue} {pos:>7}/{len:7} chunks {msg}";

fn progress_style_with_template<S: AsRef<str>>(template: S)
    -> Result<ProgressStyle>
{
    let template = template.as_ref();
    match ProgressStyle::with_template(template) {
        Ok(style) => Ok(style),
        Err(e) => {
            error!(
                "Failed to create progress bar style from template '{}': {}",
                template, e
            );
            Err(e.into())
        }
    }
}

pub(crate) fn progress_bar_with_template<S>(length: u64, template: S)
    -> Result<ProgressBar>
where
    S: AsRef<str>,
{
    let style = progress_style_with_template(template)?;
    let bar = ProgressBar::new(length);
    bar.set_style(style);
    Ok(bar)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn templates_are_valid() {
        for template in [TEMPLATE_BLOCKS, TEMPLATE_CHUNKS] {
            let bar = progress_bar_with_template(3, template).unwrap();
            assert!(!bar.is_finished());
            bar.inc(2);
            assert_eq!(bar.position(), 2);
            bar.finish_and_clear();
        }
    }
}
