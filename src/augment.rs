use image::GrayImage;
use rand::{seq::SliceRandom, Rng};

use crate::{dataset::Sample, image_data};

/// Upper bound on the number of donors glued into one synthetic sample.
const MAX_DONORS: usize = 4;

/// Builds a synthetic sample by gluing randomly picked samples of `pool`
/// side by side. Donors are added while the joined label still fits in
/// `max_len`; the first donor is always used. Returns `None` for an empty
/// pool or when no donor fits.
pub fn splice_samples<R: Rng>(
    pool: &[Sample],
    max_len: usize,
    rng: &mut R,
) -> Option<Sample> {
    let first = pool
        .choose(rng)
        .filter(|sample| sample.label.len() <= max_len)?;
    let mut donors = vec![first];
    let mut label_len = first.label.len();

    while donors.len() < MAX_DONORS && rng.gen_bool(0.5) {
        let Some(next) = pool.choose(rng) else {
            break;
        };
        if label_len + next.label.len() > max_len {
            break;
        }
        label_len += next.label.len();
        donors.push(next);
    }

    let height = donors
        .iter()
        .map(|sample| sample.image.height())
        .max()
        .unwrap_or(1);
    let images: Vec<&GrayImage> = donors.iter().map(|sample| &sample.image).collect();
    let label = donors
        .iter()
        .flat_map(|sample| sample.label.iter().copied())
        .collect();

    Some(Sample {
        image: image_data::concat_horizontally(&images, height),
        label,
    })
}
