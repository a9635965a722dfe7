// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use core::future::Future;
use core::pin::Pin;
use core::task::{Context, Poll};

/// Result of [`select2`]: which arm completed first.
#[derive(Debug, PartialEq, Eq)]
pub enum Select2<A, B> {
    First(A),
    Second(B),
}

/// Result of [`select3`].
#[derive(Debug, PartialEq, Eq)]
pub enum Select3<A, B, C> {
    First(A),
    Second(B),
    Third(C),
}

/// Waits on two futures, completing with the first one that finishes. The
/// loser is dropped, which removes its wait-list registration. When both are
/// ready in the same poll, the first arm wins.
pub fn select2<A, B>(a: A, b: B) -> Select2Future<A, B>
where
    A: Future + Unpin,
    B: Future + Unpin,
{
    Select2Future { a, b }
}

pub struct Select2Future<A, B> {
    a: A,
    b: B,
}

impl<A, B> Future for Select2Future<A, B>
where
    A: Future + Unpin,
    B: Future + Unpin,
{
    type Output = Select2<A::Output, B::Output>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if let Poll::Ready(v) = Pin::new(&mut this.a).poll(cx) {
            return Poll::Ready(Select2::First(v));
        }
        if let Poll::Ready(v) = Pin::new(&mut this.b).poll(cx) {
            return Poll::Ready(Select2::Second(v));
        }
        Poll::Pending
    }
}

/// Three-way [`select2`].
pub fn select3<A, B, C>(a: A, b: B, c: C) -> Select3Future<A, B, C>
where
    A: Future + Unpin,
    B: Future + Unpin,
    C: Future + Unpin,
{
    Select3Future { a, b, c }
}

pub struct Select3Future<A, B, C> {
    a: A,
    b: B,
    c: C,
}

impl<A, B, C> Future for Select3Future<A, B, C>
where
    A: Future + Unpin,
    B: Future + Unpin,
    C: Future + Unpin,
{
    type Output = Select3<A::Output, B::Output, C::Output>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if let Poll::Ready(v) = Pin::new(&mut this.a).poll(cx) {
            return Poll::Ready(Select3::First(v));
        }
        if let Poll::Ready(v) = Pin::new(&mut this.b).poll(cx) {
            return Poll::Ready(Select3::Second(v));
        }
        if let Poll::Ready(v) = Pin::new(&mut this.c).poll(cx) {
            return Poll::Ready(Select3::Third(v));
        }
        Poll::Pending
    }
}
