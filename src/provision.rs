//! The whole pipeline: build, populate, shrink.

use log::info;

use crate::{
    builder::create_filesystem,
    error::Result,
    extract::Extractor,
    image::Image,
    loopdev::LoopDriver,
    populate::populate,
    shrink::{shrink, MinimumSize},
    size::SizePolicy,
    source::Source,
    tools::{Checker, Formatter, Mounter, Resizer},
};

/// The capabilities a provisioning run uses, plus the sizing configuration.
pub struct Provisioner<'a> {
    pub policy: SizePolicy,
    pub formatter: &'a dyn Formatter,
    pub mounter: &'a dyn Mounter,
    pub extractor: &'a dyn Extractor,
    pub loop_driver: &'a dyn LoopDriver,
    pub checker: &'a dyn Checker,
    pub resizer: &'a dyn Resizer,
}

impl Provisioner<'_> {
    /// Builds `<object_path>/image.ext4` for `image` from `source`.
    ///
    /// Stops at the first failing stage and returns its error unchanged.  Nothing is retried
    /// and nothing is rolled back, so a failed run can leave a partially built file behind.
    pub fn provision(&self, image: &Image, source: &mut dyn Source) -> Result<MinimumSize> {
        let allocated = create_filesystem(image, &self.policy, self.formatter)?;
        populate(image, self.mounter, self.extractor, source)?;
        let min = shrink(image, self.loop_driver, self.checker, self.resizer)?;
        info!(
            "provisioned image {} ({allocated} bytes allocated, {} after shrinking)",
            image.uid(),
            min.bytes()
        );
        Ok(min)
    }

    /// Runs only the last stage, for images that were populated earlier.
    pub fn shrink(&self, image: &Image) -> Result<MinimumSize> {
        shrink(image, self.loop_driver, self.checker, self.resizer)
    }
}
