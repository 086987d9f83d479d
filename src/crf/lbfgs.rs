//! Limited-memory BFGS driven by reverse communication.
//!
//! Every call to [`Lbfgs::step`] consumes one objective/gradient evaluation
//! and either asks for another one at new trial weights or reports
//! convergence. All state lives in plain values ([`Lbfgs`], [`LineSearch`])
//! and in caller-owned slices, so it can be written into a state blob between
//! calls and restored exactly.

use serde::{Deserialize, Serialize};

use crate::error::{ensure_finite, CrfError, Result};

/// Number of f64 slots taken by [`Lbfgs`].
pub const LBFGS_SLOTS: usize = 21;
/// Number of f64 slots taken by [`LineSearch`].
pub const LINESEARCH_SLOTS: usize = 25;
pub(crate) const MEMORY_SLOT: usize = 7;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LbfgsParams {
    /// Number of correction pairs kept (m).
    pub memory: usize,
    /// Stop once `|g| / max(1, |x|) <= epsilon`.
    pub epsilon: f64,
    /// Relative width below which the line search interval is considered collapsed.
    pub xtol: f64,
    /// Sufficient decrease constant.
    pub ftol: f64,
    /// Curvature constant.
    pub gtol: f64,
    pub stpmin: f64,
    pub stpmax: f64,
    /// Maximum evaluations per line search.
    pub max_linesearch: usize,
}

impl Default for LbfgsParams {
    fn default() -> Self {
        Self {
            memory: 6,
            epsilon: 1e-5,
            xtol: 1e-16,
            ftol: 1e-4,
            gtol: 0.9,
            stpmin: 1e-20,
            stpmax: 1e20,
            max_linesearch: 20,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LbfgsStatus {
    /// Evaluate the objective at the weights just written and call again.
    Evaluate,
    Converged,
}

#[inline]
fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

#[inline]
fn axpy(a: f64, x: &[f64], y: &mut [f64]) {
    for (yi, xi) in y.iter_mut().zip(x) {
        *yi += a * xi;
    }
}

#[inline]
fn flag(b: bool) -> f64 {
    if b {
        1.0
    } else {
        0.0
    }
}

fn check_slots(what: &'static str, slots: &[f64], expected: usize) -> Result<()> {
    if slots.len() != expected {
        return Err(CrfError::DimensionMismatch {
            what,
            expected,
            found: slots.len(),
        });
    }
    Ok(())
}

/// Length of the workspace for `n` variables and `m` corrections.
pub fn workspace_len(n: usize, m: usize) -> usize {
    n * (2 * m + 1) + 2 * m
}

/// Views into the workspace: scratch vector, rho, alpha, then the `s` and `y`
/// ring buffers of `m` vectors each.
struct Workspace<'a> {
    d: &'a mut [f64],
    rho: &'a mut [f64],
    alpha: &'a mut [f64],
    s: &'a mut [f64],
    y: &'a mut [f64],
}

impl<'a> Workspace<'a> {
    fn split(w: &'a mut [f64], n: usize, m: usize) -> Self {
        let (d, rest) = w.split_at_mut(n);
        let (rho, rest) = rest.split_at_mut(m);
        let (alpha, rest) = rest.split_at_mut(m);
        let (s, y) = rest.split_at_mut(n * m);
        Self { d, rho, alpha, s, y }
    }
}

/// One end of the line search interval: step, function value, derivative.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
struct Endpoint {
    st: f64,
    f: f64,
    d: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct SearchParams {
    ftol: f64,
    gtol: f64,
    xtol: f64,
    stpmin: f64,
    stpmax: f64,
    maxfev: usize,
}

/// Moré–Thuente line search state.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct LineSearch {
    nfev: usize,
    infoc: i32,
    stage1: bool,
    brackt: bool,
    finit: f64,
    dginit: f64,
    dgtest: f64,
    width: f64,
    width1: f64,
    stmin: f64,
    stmax: f64,
    stx: Endpoint,
    sty: Endpoint,
    ftest1: f64,
    dg: f64,
    fm: f64,
    dgm: f64,
    fxm: f64,
    fym: f64,
    dgxm: f64,
    dgym: f64,
}

impl LineSearch {
    pub fn from_slots(s: &[f64]) -> Result<Self> {
        check_slots("line search state", s, LINESEARCH_SLOTS)?;
        Ok(Self {
            nfev: s[0] as usize,
            infoc: s[1] as i32,
            stage1: s[2] != 0.0,
            brackt: s[3] != 0.0,
            finit: s[4],
            dginit: s[5],
            dgtest: s[6],
            width: s[7],
            width1: s[8],
            stmin: s[9],
            stmax: s[10],
            stx: Endpoint {
                st: s[11],
                f: s[12],
                d: s[13],
            },
            sty: Endpoint {
                st: s[14],
                f: s[15],
                d: s[16],
            },
            ftest1: s[17],
            dg: s[18],
            fm: s[19],
            dgm: s[20],
            fxm: s[21],
            fym: s[22],
            dgxm: s[23],
            dgym: s[24],
        })
    }

    pub fn to_slots(&self, s: &mut [f64]) -> Result<()> {
        check_slots("line search state", s, LINESEARCH_SLOTS)?;
        s.copy_from_slice(&[
            self.nfev as f64,
            self.infoc as f64,
            flag(self.stage1),
            flag(self.brackt),
            self.finit,
            self.dginit,
            self.dgtest,
            self.width,
            self.width1,
            self.stmin,
            self.stmax,
            self.stx.st,
            self.stx.f,
            self.stx.d,
            self.sty.st,
            self.sty.f,
            self.sty.d,
            self.ftest1,
            self.dg,
            self.fm,
            self.dgm,
            self.fxm,
            self.fym,
            self.dgxm,
            self.dgym,
        ]);
        Ok(())
    }

    /// Evaluations spent in the current search.
    pub fn evaluations(&self) -> usize {
        self.nfev
    }

    /// Advances the search by one evaluation.
    ///
    /// With `info != -1` a new search starts from `x`, with `f` and `g` taken
    /// at `x`; `wa` keeps the starting point. With `info == -1`, `f` and `g`
    /// belong to the trial point written on the previous call. On return
    /// `info` is -1 when `x` holds a new trial point, 1 when the sufficient
    /// decrease and curvature conditions hold, and 2..=6 when the search
    /// stopped without meeting them.
    #[allow(clippy::too_many_arguments)]
    fn search(
        &mut self,
        x: &mut [f64],
        f: f64,
        g: &[f64],
        s: &[f64],
        stp: &mut f64,
        wa: &mut [f64],
        p: &SearchParams,
        info: &mut i32,
    ) -> Result<()> {
        const P5: f64 = 0.5;
        const P66: f64 = 0.66;
        const XTRAPF: f64 = 4.0;

        if *info == -1 {
            *info = 0;
            self.nfev += 1;
            self.dg = dot(g, s);
            self.ftest1 = self.finit + *stp * self.dgtest;

            /* Test for convergence. */
            if (self.brackt && (*stp <= self.stmin || *stp >= self.stmax)) || self.infoc == 0 {
                *info = 6;
            }
            if *stp == p.stpmax && f <= self.ftest1 && self.dg <= self.dgtest {
                *info = 5;
            }
            if *stp == p.stpmin && (f > self.ftest1 || self.dg >= self.dgtest) {
                *info = 4;
            }
            if self.nfev >= p.maxfev {
                *info = 3;
            }
            if self.brackt && self.stmax - self.stmin <= p.xtol * self.stmax {
                *info = 2;
            }
            if f <= self.ftest1 && self.dg.abs() <= p.gtol * (-self.dginit) {
                *info = 1;
            }
            if *info != 0 {
                return Ok(());
            }

            /* The first stage ends once a step has sufficient decrease and a
            non-negative modified derivative. */
            if self.stage1 && f <= self.ftest1 && self.dg >= p.ftol.min(p.gtol) * self.dginit {
                self.stage1 = false;
            }

            if self.stage1 && f <= self.stx.f && f > self.ftest1 {
                /* Use the modified function psi(stp) = f(stp) - f(0) - ftol * stp * f'(0). */
                self.fm = f - *stp * self.dgtest;
                self.fxm = self.stx.f - self.stx.st * self.dgtest;
                self.fym = self.sty.f - self.sty.st * self.dgtest;
                self.dgm = self.dg - self.dgtest;
                self.dgxm = self.stx.d - self.dgtest;
                self.dgym = self.sty.d - self.dgtest;
                let mut mx = Endpoint {
                    st: self.stx.st,
                    f: self.fxm,
                    d: self.dgxm,
                };
                let mut my = Endpoint {
                    st: self.sty.st,
                    f: self.fym,
                    d: self.dgym,
                };
                self.infoc = mcstep(
                    &mut mx,
                    &mut my,
                    stp,
                    self.fm,
                    self.dgm,
                    &mut self.brackt,
                    self.stmin,
                    self.stmax,
                );
                self.fxm = mx.f;
                self.fym = my.f;
                self.dgxm = mx.d;
                self.dgym = my.d;
                self.stx = Endpoint {
                    st: mx.st,
                    f: self.fxm + mx.st * self.dgtest,
                    d: self.dgxm + self.dgtest,
                };
                self.sty = Endpoint {
                    st: my.st,
                    f: self.fym + my.st * self.dgtest,
                    d: self.dgym + self.dgtest,
                };
            } else {
                self.infoc = mcstep(
                    &mut self.stx,
                    &mut self.sty,
                    stp,
                    f,
                    self.dg,
                    &mut self.brackt,
                    self.stmin,
                    self.stmax,
                );
            }

            /* Force a sufficient decrease in the size of the interval. */
            if self.brackt {
                if (self.sty.st - self.stx.st).abs() >= P66 * self.width1 {
                    *stp = self.stx.st + P5 * (self.sty.st - self.stx.st);
                }
                self.width1 = self.width;
                self.width = (self.sty.st - self.stx.st).abs();
            }
        } else {
            self.infoc = 1;
            if *stp <= 0.0
                || p.ftol < 0.0
                || p.gtol < 0.0
                || p.xtol < 0.0
                || p.stpmin < 0.0
                || p.stpmax < p.stpmin
                || p.maxfev == 0
            {
                return Err(CrfError::LineSearchFailure {
                    info: 0,
                    reason: "invalid line search parameters",
                });
            }
            self.dginit = dot(g, s);
            if self.dginit >= 0.0 {
                return Err(CrfError::LineSearchFailure {
                    info: 0,
                    reason: "the search direction is not a descent direction",
                });
            }
            self.brackt = false;
            self.stage1 = true;
            self.nfev = 0;
            self.finit = f;
            self.dgtest = p.ftol * self.dginit;
            self.width = p.stpmax - p.stpmin;
            self.width1 = self.width / P5;
            wa.copy_from_slice(x);
            self.stx = Endpoint {
                st: 0.0,
                f: self.finit,
                d: self.dginit,
            };
            self.sty = self.stx;
        }

        /* Set the interval of uncertainty for the next trial step. */
        if self.brackt {
            self.stmin = self.stx.st.min(self.sty.st);
            self.stmax = self.stx.st.max(self.sty.st);
        } else {
            self.stmin = self.stx.st;
            self.stmax = *stp + XTRAPF * (*stp - self.stx.st);
        }
        *stp = stp.max(p.stpmin).min(p.stpmax);

        /* Fall back to the best step so far if nothing better can be found. */
        if (self.brackt && (*stp <= self.stmin || *stp >= self.stmax))
            || self.nfev + 1 >= p.maxfev
            || self.infoc == 0
            || (self.brackt && self.stmax - self.stmin <= p.xtol * self.stmax)
        {
            *stp = self.stx.st;
        }

        for ((xj, wj), sj) in x.iter_mut().zip(wa.iter()).zip(s) {
            *xj = wj + *stp * sj;
        }
        *info = -1;
        Ok(())
    }
}

/// Safeguarded step of the Moré–Thuente search.
///
/// `x` is the endpoint with the lowest function value so far, `y` the other
/// end of the interval, and `(stp, fp, dp)` the current trial. Updates the
/// interval and writes the next trial step into `stp`. Returns the case that
/// applied (1..=4), or 0 on inconsistent input.
#[allow(clippy::too_many_arguments)]
fn mcstep(
    x: &mut Endpoint,
    y: &mut Endpoint,
    stp: &mut f64,
    fp: f64,
    dp: f64,
    brackt: &mut bool,
    stpmin: f64,
    stpmax: f64,
) -> i32 {
    let t = *stp;
    if (*brackt && (t <= x.st.min(y.st) || t >= x.st.max(y.st)))
        || x.d * (t - x.st) >= 0.0
        || stpmax < stpmin
    {
        return 0;
    }
    let sgnd = dp * (x.d / x.d.abs());

    let info;
    let bound;
    let stpf;
    if fp > x.f {
        /* Higher function value: the minimum is bracketed. Take the cubic
        step if it is closer to stx, else the average of cubic and quadratic. */
        info = 1;
        bound = true;
        let theta = 3.0 * (x.f - fp) / (t - x.st) + x.d + dp;
        let s = theta.abs().max(x.d.abs()).max(dp.abs());
        let mut gamma = s * ((theta / s).powi(2) - (x.d / s) * (dp / s)).sqrt();
        if t < x.st {
            gamma = -gamma;
        }
        let p = (gamma - x.d) + theta;
        let q = ((gamma - x.d) + gamma) + dp;
        let r = p / q;
        let stpc = x.st + r * (t - x.st);
        let stpq = x.st + ((x.d / ((x.f - fp) / (t - x.st) + x.d)) / 2.0) * (t - x.st);
        stpf = if (stpc - x.st).abs() < (stpq - x.st).abs() {
            stpc
        } else {
            stpc + (stpq - stpc) / 2.0
        };
        *brackt = true;
    } else if sgnd < 0.0 {
        /* Derivatives of opposite sign: the minimum is bracketed. Take the
        step farther from stp. */
        info = 2;
        bound = false;
        let theta = 3.0 * (x.f - fp) / (t - x.st) + x.d + dp;
        let s = theta.abs().max(x.d.abs()).max(dp.abs());
        let mut gamma = s * ((theta / s).powi(2) - (x.d / s) * (dp / s)).sqrt();
        if t > x.st {
            gamma = -gamma;
        }
        let p = (gamma - dp) + theta;
        let q = ((gamma - dp) + gamma) + x.d;
        let r = p / q;
        let stpc = t + r * (x.st - t);
        let stpq = t + (dp / (dp - x.d)) * (x.st - t);
        stpf = if (stpc - t).abs() > (stpq - t).abs() {
            stpc
        } else {
            stpq
        };
        *brackt = true;
    } else if dp.abs() < x.d.abs() {
        /* Lower function value, same sign, decreasing derivative magnitude. */
        info = 3;
        bound = true;
        let theta = 3.0 * (x.f - fp) / (t - x.st) + x.d + dp;
        let s = theta.abs().max(x.d.abs()).max(dp.abs());
        let mut gamma = s * ((theta / s).powi(2) - (x.d / s) * (dp / s)).max(0.0).sqrt();
        if t > x.st {
            gamma = -gamma;
        }
        let p = (gamma - dp) + theta;
        let q = (gamma + (x.d - dp)) + gamma;
        let r = p / q;
        let stpc = if r < 0.0 && gamma != 0.0 {
            t + r * (x.st - t)
        } else if t > x.st {
            stpmax
        } else {
            stpmin
        };
        let stpq = t + (dp / (dp - x.d)) * (x.st - t);
        stpf = if *brackt {
            if (t - stpc).abs() < (t - stpq).abs() {
                stpc
            } else {
                stpq
            }
        } else if (t - stpc).abs() > (t - stpq).abs() {
            stpc
        } else {
            stpq
        };
    } else {
        /* Lower function value, same sign, non-decreasing derivative magnitude. */
        info = 4;
        bound = false;
        stpf = if *brackt {
            let theta = 3.0 * (fp - y.f) / (y.st - t) + y.d + dp;
            let s = theta.abs().max(y.d.abs()).max(dp.abs());
            let mut gamma = s * ((theta / s).powi(2) - (y.d / s) * (dp / s)).sqrt();
            if t > y.st {
                gamma = -gamma;
            }
            let p = (gamma - dp) + theta;
            let q = ((gamma - dp) + gamma) + y.d;
            let r = p / q;
            t + r * (y.st - t)
        } else if t > x.st {
            stpmax
        } else {
            stpmin
        };
    }

    /* Update the interval of uncertainty. */
    let trial = Endpoint { st: t, f: fp, d: dp };
    if fp > x.f {
        *y = trial;
    } else {
        if sgnd < 0.0 {
            *y = *x;
        }
        *x = trial;
    }

    /* Safeguard the new step. */
    *stp = stpf.min(stpmax).max(stpmin);
    if *brackt && bound {
        let limit = x.st + 0.66 * (y.st - x.st);
        *stp = if y.st > x.st {
            stp.min(limit)
        } else {
            stp.max(limit)
        };
    }
    info
}

fn search_failure(info: i32) -> CrfError {
    let reason = match info {
        2 => "relative width of the interval of uncertainty is at most xtol",
        3 => "number of evaluations reached the limit",
        4 => "the step is at the lower bound stpmin",
        5 => "the step is at the upper bound stpmax",
        6 => "rounding errors prevent further progress",
        _ => "unexpected line search status",
    };
    CrfError::LineSearchFailure { info, reason }
}

/// Optimizer state of a limited-memory BFGS run.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Lbfgs {
    /// 0: start a new run on the next call; 1: a line search awaits an evaluation.
    iflag: i32,
    iter: usize,
    nfun: usize,
    point: usize,
    npt: usize,
    bound: usize,
    info: i32,
    memory: usize,
    maxfev: usize,
    stp: f64,
    stp1: f64,
    ftol: f64,
    gtol: f64,
    stpmin: f64,
    stpmax: f64,
    xtol: f64,
    ys: f64,
    yy: f64,
    gnorm: f64,
    xnorm: f64,
    finish: bool,
}

impl Lbfgs {
    pub fn new(params: &LbfgsParams) -> Result<Self> {
        if params.memory == 0 {
            return Err(CrfError::InvalidParameters(
                "the history depth must be positive".into(),
            ));
        }
        if params.max_linesearch == 0 {
            return Err(CrfError::InvalidParameters(
                "the line search needs at least one evaluation".into(),
            ));
        }
        Ok(Self {
            memory: params.memory,
            maxfev: params.max_linesearch,
            ftol: params.ftol,
            gtol: if params.gtol <= 1e-4 { 0.9 } else { params.gtol },
            stpmin: params.stpmin,
            stpmax: params.stpmax,
            xtol: params.xtol,
            ..Default::default()
        })
    }

    pub fn from_slots(s: &[f64]) -> Result<Self> {
        check_slots("optimizer state", s, LBFGS_SLOTS)?;
        let run = Self {
            iflag: s[0] as i32,
            iter: s[1] as usize,
            nfun: s[2] as usize,
            point: s[3] as usize,
            npt: s[4] as usize,
            bound: s[5] as usize,
            info: s[6] as i32,
            memory: s[MEMORY_SLOT] as usize,
            maxfev: s[8] as usize,
            stp: s[9],
            stp1: s[10],
            ftol: s[11],
            gtol: s[12],
            stpmin: s[13],
            stpmax: s[14],
            xtol: s[15],
            ys: s[16],
            yy: s[17],
            gnorm: s[18],
            xnorm: s[19],
            finish: s[20] != 0.0,
        };
        /* The ring position and length index the history. */
        let last = run.memory.saturating_sub(1);
        for (what, found, expected) in [
            ("history position", run.point, last),
            ("history length", run.bound, run.memory),
        ] {
            if found > expected {
                return Err(CrfError::DimensionMismatch { what, expected, found });
            }
        }
        Ok(run)
    }

    pub fn to_slots(&self, s: &mut [f64]) -> Result<()> {
        check_slots("optimizer state", s, LBFGS_SLOTS)?;
        s.copy_from_slice(&[
            self.iflag as f64,
            self.iter as f64,
            self.nfun as f64,
            self.point as f64,
            self.npt as f64,
            self.bound as f64,
            self.info as f64,
            self.memory as f64,
            self.maxfev as f64,
            self.stp,
            self.stp1,
            self.ftol,
            self.gtol,
            self.stpmin,
            self.stpmax,
            self.xtol,
            self.ys,
            self.yy,
            self.gnorm,
            self.xnorm,
            flag(self.finish),
        ]);
        Ok(())
    }

    pub fn memory(&self) -> usize {
        self.memory
    }

    /// Completed quasi-Newton iterations.
    pub fn iterations(&self) -> usize {
        self.iter
    }

    /// Function evaluations consumed by completed line searches.
    pub fn evaluations(&self) -> usize {
        self.nfun
    }

    pub fn gnorm(&self) -> f64 {
        self.gnorm
    }

    /// Whether a line search is waiting for an evaluation.
    pub fn is_searching(&self) -> bool {
        self.iflag == 1
    }

    pub fn is_finished(&self) -> bool {
        self.finish
    }

    fn search_params(&self) -> SearchParams {
        SearchParams {
            ftol: self.ftol,
            gtol: self.gtol,
            xtol: self.xtol,
            stpmin: self.stpmin,
            stpmax: self.stpmax,
            maxfev: self.maxfev,
        }
    }

    /// Consumes the evaluation `(f, g)` at `x` and writes the next trial
    /// point into `x`.
    ///
    /// `diag` holds the inverse Hessian diagonal between iterations and the
    /// line search origin during a search. `w` is the workspace of
    /// [`workspace_len`] values.
    #[allow(clippy::too_many_arguments)]
    pub fn step(
        &mut self,
        ls: &mut LineSearch,
        x: &mut [f64],
        f: f64,
        g: &[f64],
        diag: &mut [f64],
        w: &mut [f64],
        epsilon: f64,
        xtol: f64,
    ) -> Result<LbfgsStatus> {
        let n = x.len();
        let m = self.memory;
        if n == 0 || m == 0 {
            return Err(CrfError::InvalidParameters(format!(
                "the dimension and history depth must be positive (n = {n}, m = {m})"
            )));
        }
        if !(epsilon > 0.0) || !(xtol >= 0.0) {
            return Err(CrfError::InvalidParameters(format!(
                "tolerances must be positive (epsilon = {epsilon}, xtol = {xtol})"
            )));
        }
        for (what, len) in [("gradient", g.len()), ("diagonal", diag.len())] {
            if len != n {
                return Err(CrfError::DimensionMismatch {
                    what,
                    expected: n,
                    found: len,
                });
            }
        }
        if w.len() != workspace_len(n, m) {
            return Err(CrfError::DimensionMismatch {
                what: "optimizer workspace",
                expected: workspace_len(n, m),
                found: w.len(),
            });
        }
        if self.npt > (m - 1) * n {
            return Err(CrfError::DimensionMismatch {
                what: "history offset",
                expected: (m - 1) * n,
                found: self.npt,
            });
        }
        if !f.is_finite() {
            return Err(CrfError::NonFiniteValue("objective"));
        }
        ensure_finite("gradient", g)?;
        self.xtol = xtol;

        let status = self.advance(ls, x, f, g, diag, w, epsilon);
        if status.is_err() {
            self.iflag = -1;
        }
        status
    }

    #[allow(clippy::too_many_arguments)]
    fn advance(
        &mut self,
        ls: &mut LineSearch,
        x: &mut [f64],
        f: f64,
        g: &[f64],
        diag: &mut [f64],
        w: &mut [f64],
        epsilon: f64,
    ) -> Result<LbfgsStatus> {
        let n = x.len();
        if self.iflag != 1 {
            self.initialize(g, diag, w);
            if self.gnorm == 0.0 {
                self.finish = true;
                self.iflag = 0;
                return Ok(LbfgsStatus::Converged);
            }
            *ls = LineSearch::default();
            self.begin_iteration(g, diag, w)?;
        }
        loop {
            let ispt = n + 2 * self.memory;
            let start = ispt + self.point * n;
            let params = self.search_params();
            let direction = &w[start..start + n];
            ls.search(x, f, g, direction, &mut self.stp, diag, &params, &mut self.info)?;
            if self.info == -1 {
                self.iflag = 1;
                return Ok(LbfgsStatus::Evaluate);
            }
            if self.info != 1 {
                return Err(search_failure(self.info));
            }
            self.nfun += ls.nfev;
            if self.complete_iteration(x, g, w, epsilon) {
                self.iflag = 0;
                return Ok(LbfgsStatus::Converged);
            }
            self.begin_iteration(g, diag, w)?;
        }
    }

    fn initialize(&mut self, g: &[f64], diag: &mut [f64], w: &mut [f64]) {
        let n = g.len();
        let m = self.memory;
        self.iter = 0;
        self.nfun = 1;
        self.point = 0;
        self.npt = 0;
        self.bound = 0;
        self.info = 0;
        self.finish = false;
        self.ys = 0.0;
        self.yy = 0.0;
        diag.iter_mut().for_each(|d| *d = 1.0);
        w.iter_mut().for_each(|v| *v = 0.0);

        /* The first direction is the steepest descent scaled by the initial diagonal. */
        let ws = Workspace::split(w, n, m);
        for ((si, gi), di) in ws.s[..n].iter_mut().zip(g).zip(diag.iter()) {
            *si = -gi * di;
        }
        self.gnorm = dot(g, g).sqrt();
        self.stp1 = 1.0 / self.gnorm;
    }

    /// Starts an iteration: computes the search direction with the two-loop
    /// recursion and stores it at the current ring position.
    fn begin_iteration(&mut self, g: &[f64], diag: &mut [f64], w: &mut [f64]) -> Result<()> {
        let n = g.len();
        let m = self.memory;
        self.iter += 1;
        self.info = 0;
        self.bound = self.iter - 1;
        let ws = Workspace::split(w, n, m);
        if self.iter != 1 {
            if self.iter > m {
                self.bound = m;
            }
            let npt = self.npt;
            self.ys = dot(&ws.y[npt..npt + n], &ws.s[npt..npt + n]);
            self.yy = dot(&ws.y[npt..npt + n], &ws.y[npt..npt + n]);
            let h0 = self.ys / self.yy;
            if !(h0 > 0.0 && h0.is_finite()) {
                return Err(CrfError::DivergentHessianDiagonal(h0));
            }
            diag.iter_mut().for_each(|d| *d = h0);

            let cp = if self.point == 0 { m } else { self.point };
            ws.rho[cp - 1] = 1.0 / self.ys;
            for (di, gi) in ws.d.iter_mut().zip(g) {
                *di = -gi;
            }

            let mut cp = self.point;
            for _ in 0..self.bound {
                cp = if cp == 0 { m - 1 } else { cp - 1 };
                let sq = dot(&ws.s[cp * n..(cp + 1) * n], ws.d);
                ws.alpha[cp] = ws.rho[cp] * sq;
                axpy(-ws.alpha[cp], &ws.y[cp * n..(cp + 1) * n], ws.d);
            }
            for (di, hi) in ws.d.iter_mut().zip(diag.iter()) {
                *di *= hi;
            }
            for _ in 0..self.bound {
                let yr = dot(&ws.y[cp * n..(cp + 1) * n], ws.d);
                let beta = ws.alpha[cp] - ws.rho[cp] * yr;
                axpy(beta, &ws.s[cp * n..(cp + 1) * n], ws.d);
                cp = (cp + 1) % m;
            }

            let at = self.point * n;
            ws.s[at..at + n].copy_from_slice(ws.d);
        }
        self.stp = if self.iter == 1 { self.stp1 } else { 1.0 };
        /* Keep the gradient at the search origin for the y update. */
        ws.d.copy_from_slice(g);
        Ok(())
    }

    /// Records the accepted step in the history and tests for convergence.
    fn complete_iteration(&mut self, x: &[f64], g: &[f64], w: &mut [f64], epsilon: f64) -> bool {
        let n = g.len();
        let ws = Workspace::split(w, n, self.memory);
        self.npt = self.point * n;
        let npt = self.npt;
        for i in 0..n {
            ws.s[npt + i] *= self.stp;
            ws.y[npt + i] = g[i] - ws.d[i];
        }
        self.point = (self.point + 1) % self.memory;

        self.gnorm = dot(g, g).sqrt();
        self.xnorm = dot(x, x).sqrt().max(1.0);
        self.finish = self.gnorm / self.xnorm <= epsilon;
        self.finish
    }
}
