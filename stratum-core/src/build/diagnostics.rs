//! Cache-miss diagnostics for strict mode.
//!
//! When a build runs in `should_be_built_mode`, a cache miss is a hard
//! error; this reporter explains the likely causes before the build aborts
//! with "stages required".

use crate::image::Image;
use crate::stage::Stage;
use tracing::warn;

/// Emit the structured "stage is not in the stages storage" warning with the
/// numbered possible reasons.
pub fn print_should_be_built_error(img: &Image, stage: &Stage) {
    let digest = stage.digest().unwrap_or_default();
    warn!(
        "{} with digest {} is not exist in stages storage",
        stage.log_detailed_name(),
        digest
    );
    warn!("There are some possible reasons:");

    let mut reason = 0;
    let mut next = || {
        reason += 1;
        reason
    };

    if img.is_dockerfile_image() {
        warn!(
            "({}) Dockerfile has COPY or ADD instruction which uses non-permanent data \
             that affects stage digest:\n\
             - .git directory which should be excluded with .dockerignore file\n\
             - auto-generated file",
            next()
        );
    }

    warn!(
        "({}) stratum.yaml has non-permanent data that affects stage digest:\n\
         - environment variable (e.g. {{{{ env \"JOB_ID\" }}}})\n\
         - dynamic template function (e.g. a date function)\n\
         - auto-generated file content (e.g. {{{{ .Files.Get \"hash_sum_of_something\" }}}})",
        next()
    );

    warn!(
        "To quickly find the problem compare current and previous rendered configurations. \
         Get the path at the beginning of command output by the following prefix \
         'Using config render file: '."
    );

    warn!(
        "({}) Stages have not been built yet or stages have been removed:\n\
         - automatically with the cleanup command\n\
         - manually with the purge commands",
        next()
    );
}
